//! Push engine: fingerprints each built document, skips unchanged ones,
//! hands the rest to the job dispatcher and keeps per-router commit stats.

pub mod state;

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::abstract_config::canonical::{canonical_bytes, fingerprint_bytes};
use crate::abstract_config::Device;
use crate::composer::FeatureConfig;
use crate::error::{PipelineError, Result};
use crate::events::{EventType, Hub, PushPayload};
use crate::intent::{Graph, PrId};
use crate::jobs::{JobDispatcher, JobSpec};
use crate::utils::format_timestamp;
pub use state::{CommitStats, DeviceStatus, PushState};
use state::DeviceRecord;

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub repush_interval: Duration,
    pub repush_max_interval: Duration,
    /// Settle delay per KB pushed; zero disables the delay
    pub push_delay_per_kb: f64,
    pub push_delay_max: Duration,
    /// Push even when the fingerprint is unchanged
    pub forced_cfg_push: bool,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            repush_interval: Duration::from_secs(15),
            repush_max_interval: Duration::from_secs(300),
            push_delay_per_kb: 0.01,
            push_delay_max: Duration::from_secs(5),
            forced_cfg_push: false,
        }
    }
}

impl PushSettings {
    /// Pause after a successful push of `byte_count` bytes
    pub fn push_delay(&self, byte_count: usize) -> Duration {
        if self.push_delay_per_kb <= 0.0 {
            return Duration::ZERO;
        }
        let secs = (byte_count as f64 / 1000.0) * self.push_delay_per_kb;
        Duration::from_secs_f64(secs).min(self.push_delay_max)
    }
}

/// Identity of the router a document is pushed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub uuid: String,
    pub name: String,
    pub fabric: Option<String>,
    pub management_ip: String,
    pub vnc_managed: bool,
}

impl PushTarget {
    pub fn from_graph(graph: &Graph, pr_id: PrId) -> Self {
        let pr = graph.pr(pr_id);
        Self {
            uuid: pr.uuid().to_string(),
            name: pr.name(),
            fabric: pr.fabric.map(|f| graph.fabric(f).name()),
            management_ip: pr.props.management_ip.clone(),
            vnc_managed: pr.props.vnc_managed,
        }
    }
}

pub struct PushEngine {
    dispatcher: Arc<JobDispatcher>,
    settings: PushSettings,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    push_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    forced: Mutex<HashSet<String>>,
    ws_hub: Option<Arc<Hub>>,
    cancel: CancellationToken,
}

impl PushEngine {
    pub fn new(dispatcher: Arc<JobDispatcher>, settings: PushSettings, ws_hub: Option<Arc<Hub>>) -> Self {
        Self {
            dispatcher,
            settings,
            devices: RwLock::new(HashMap::new()),
            push_locks: Mutex::new(HashMap::new()),
            forced: Mutex::new(HashSet::new()),
            ws_hub,
            cancel: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &PushSettings {
        &self.settings
    }

    /// Cancel every in-flight job wait
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Push the next document for `uuid` even if unchanged
    pub fn force_next_push(&self, uuid: &str) {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid.to_string());
    }

    fn take_forced(&self, uuid: &str) -> bool {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uuid)
    }

    pub fn status(&self, uuid: &str) -> Option<DeviceStatus> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(uuid).map(|r| r.status(uuid))
    }

    pub fn statuses(&self) -> Vec<DeviceStatus> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<DeviceStatus> = devices.iter().map(|(uuid, r)| r.status(uuid)).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn state(&self, uuid: &str) -> PushState {
        self.status(uuid).map(|s| s.state).unwrap_or_default()
    }

    /// Last document handed to the job worker for `uuid`
    pub fn last_document(&self, uuid: &str) -> Option<serde_json::Value> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(uuid).and_then(|r| r.last_document.clone())
    }

    fn config_sent(&self, uuid: &str) -> bool {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(uuid).map(|r| r.config_sent).unwrap_or(false)
    }

    /// Drop everything known about a router that left the intent
    pub fn forget(&self, uuid: &str) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uuid);
        self.push_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uuid);
    }

    fn push_lock(&self, uuid: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.push_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uuid.to_string())
            .or_default()
            .clone()
    }

    fn update<F: FnOnce(&mut DeviceRecord)>(&self, target: &PushTarget, f: F) {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let record = devices
            .entry(target.uuid.clone())
            .or_insert_with(|| DeviceRecord::new(&target.name, self.settings.repush_interval));
        record.name = target.name.clone();
        f(record);
    }

    async fn event(&self, event_type: EventType, target: &PushTarget, state: PushState, byte_count: Option<usize>, message: Option<String>) {
        if let Some(ref hub) = self.ws_hub {
            hub.broadcast_push(
                event_type,
                PushPayload {
                    uuid: target.uuid.clone(),
                    name: target.name.clone(),
                    state: state.as_str().to_string(),
                    byte_count,
                    message,
                },
            )
            .await;
        }
    }

    /// Reconcile entry point for one router: unmanaged routers get their
    /// config removed once, empty builds are not pushed.
    pub async fn push(&self, target: &PushTarget, features: &FeatureConfig) -> Result<usize> {
        if !target.vnc_managed {
            if self.config_sent(&target.uuid) {
                return self.delete_config(target, &features.job_template).await;
            }
            tracing::info!(
                "vnc managed property must be set for {} ({}) to get auto configured, not pushing config",
                target.name,
                target.management_ip
            );
            return Ok(0);
        }
        if features.device.is_empty() {
            tracing::info!("Nothing built for {}, not pushing config", target.name);
            self.event(EventType::PushSkipped, target, self.state(&target.uuid), None, None).await;
            return Ok(0);
        }
        self.send_conf(target, features, false, true).await
    }

    /// Remove what was pushed to a router
    pub async fn delete_config(&self, target: &PushTarget, job_template: &[String]) -> Result<usize> {
        if !self.config_sent(&target.uuid) {
            return Ok(0);
        }
        let features = FeatureConfig {
            job_template: job_template.to_vec(),
            ..Default::default()
        };
        self.send_conf(target, &features, true, true).await
    }

    /// Fingerprint, then dispatch unless unchanged. Returns the serialized
    /// size of what was sent, 0 when nothing was.
    ///
    /// A router outside any fabric or without a job template is skipped
    /// with a warning. Job failures are recorded on the router's state
    /// (RETRY when `retry`, else FAILED); only cancellation is an error.
    pub async fn send_conf(
        &self,
        target: &PushTarget,
        features: &FeatureConfig,
        is_delete: bool,
        retry: bool,
    ) -> Result<usize> {
        let Some(fabric) = target.fabric.as_deref() else {
            tracing::warn!("{} is not bound to a fabric, not pushing config", target.name);
            return Ok(0);
        };
        if features.job_template.is_empty() {
            tracing::warn!("No job template for {}, not pushing config", target.name);
            return Ok(0);
        }

        let lock = self.push_lock(&target.uuid);
        let _serialized = lock.lock().await;

        let document = if is_delete {
            Device::default()
        } else {
            features.device.clone()
        };
        let bytes = canonical_bytes(&document)?;
        let hash = fingerprint_bytes(&bytes);
        let forced = self.settings.forced_cfg_push | self.take_forced(&target.uuid);

        {
            let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = devices.get(&target.uuid) {
                if !is_delete && !forced && record.last_config_hash.as_deref() == Some(hash.as_str()) {
                    tracing::debug!("Config for {} unchanged ({}), skipping push", target.name, hash);
                    return Ok(0);
                }
                if let Some(until) = record.blocked_until {
                    if !forced && Instant::now() < until {
                        tracing::info!(
                            "Repush to {} deferred for {:?}",
                            target.name,
                            until.saturating_duration_since(Instant::now())
                        );
                        return Ok(0);
                    }
                }
            }
        }

        let abstract_config: serde_json::Value = serde_json::from_slice(&bytes)?;
        let byte_count = bytes.len();
        let job = JobSpec {
            template: features.job_template.clone(),
            input: json!({
                "device_abstract_config": abstract_config,
                "is_delete": is_delete,
                "fabric_fq_name": fabric,
                "enabled_features": features.features,
                "manage_underlay": true,
            }),
            device_list: vec![target.uuid.clone()],
            transaction_id: format!("{}-{}", target.uuid, &hash[..12]),
            transaction_descr: if is_delete {
                format!("Delete config of {}", target.name)
            } else {
                format!("Push config to {}", target.name)
            },
        };

        self.update(target, |r| r.state = PushState::InProgress);
        self.event(EventType::PushStarted, target, PushState::InProgress, Some(byte_count), None)
            .await;

        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let result = self.dispatcher.execute(&job, &self.cancel).await;
        let duration = start.elapsed().as_secs_f64().to_string();

        match result {
            Ok(outcome) => {
                let base_interval = self.settings.repush_interval;
                // a router whose config was removed starts over
                let settled = if is_delete { PushState::Init } else { PushState::Success };
                self.update(target, |r| {
                    r.state = settled;
                    r.stats.total_commits_sent_since_up += 1;
                    r.stats.commit_status_message = "success".to_string();
                    r.stats.last_commit_time = format_timestamp(chrono::Utc::now());
                    r.stats.last_commit_duration = duration;
                    r.last_config_hash = if is_delete { None } else { Some(hash.clone()) };
                    r.last_document = Some(abstract_config);
                    r.last_byte_count = byte_count;
                    r.config_sent = !is_delete;
                    r.repush_interval = base_interval;
                    r.blocked_until = None;
                });
                tracing::info!(
                    "Pushed config to {} ({} bytes, job {})",
                    target.name,
                    byte_count,
                    outcome.execution_id
                );
                self.event(EventType::PushSucceeded, target, settled, Some(byte_count), None)
                    .await;

                let delay = self.settings.push_delay(byte_count);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(byte_count)
            }
            Err(e) => {
                let message = match e {
                    PipelineError::PushTransportFailure(_) => e.to_string(),
                    ref other => PipelineError::PushTransportFailure(other.to_string()).to_string(),
                };
                let state = if retry { PushState::Retry } else { PushState::Failed };
                let max_interval = self.settings.repush_max_interval;
                let mut waited = Duration::ZERO;
                self.update(target, |r| {
                    r.state = state;
                    r.stats.commit_status_message = message.clone();
                    r.stats.last_commit_time = format_timestamp(started_at);
                    r.stats.last_commit_duration = duration;
                    r.last_document = Some(abstract_config.clone());
                    r.last_byte_count = byte_count;
                    if retry {
                        waited = r.repush_interval;
                        r.blocked_until = Some(Instant::now() + r.repush_interval);
                        r.repush_interval = (r.repush_interval * 2).min(max_interval);
                    }
                });
                tracing::error!(
                    "Push to {} {}: {}; abstract config: {}",
                    target.name,
                    state.as_str(),
                    message,
                    abstract_config
                );
                if retry {
                    tracing::info!("Next push to {} in {:?}", target.name, waited);
                }
                let event_type = if retry { EventType::PushRetry } else { EventType::PushFailed };
                self.event(event_type, target, state, Some(byte_count), Some(message)).await;

                if e == PipelineError::Cancelled {
                    return Err(e);
                }
                Ok(byte_count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::{Composer, DeviceAllocations};
    use crate::coord::{memory::MemoryBackend, retry::RetryPolicy, CoordClient};
    use crate::intent::fixtures;
    use crate::jobs::bus::LocalBus;
    use crate::jobs::worker::{JobWorker, WorkerSettings};
    use crate::jobs::DispatcherSettings;

    struct Rig {
        coord: Arc<CoordClient>,
        engine: PushEngine,
        hub: Arc<Hub>,
    }

    async fn rig(with_worker: bool, worker_settings: WorkerSettings) -> Rig {
        let coord = CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap();
        let bus = Arc::new(LocalBus::new());
        if with_worker {
            JobWorker::new(bus.clone(), coord.clone(), worker_settings)
                .start()
                .await
                .unwrap();
        }
        let dispatcher = Arc::new(JobDispatcher::new(
            bus,
            DispatcherSettings {
                timeout: Duration::from_secs(1),
                max_retries: 5,
                ..Default::default()
            },
        ));
        let hub = Arc::new(Hub::new());
        let engine = PushEngine::new(dispatcher, PushSettings::default(), Some(hub.clone()));
        Rig { coord, engine, hub }
    }

    async fn leaf_features(coord: Arc<CoordClient>) -> (PushTarget, FeatureConfig) {
        let graph = fixtures::fabric_graph();
        let pr = graph.pr_by_uuid(fixtures::LEAF1).unwrap();
        let features = Composer::new(coord, 128)
            .build(&graph, pr, &DeviceAllocations::default())
            .await
            .unwrap();
        (PushTarget::from_graph(&graph, pr), features)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_intent_pushes_once() {
        let rig = rig(true, WorkerSettings::default()).await;
        let mut hashes = Vec::new();
        for pass in 0..3 {
            // rebuilt every pass, as a reconcile would
            let (target, features) = leaf_features(rig.coord.clone()).await;
            let sent = rig.engine.push(&target, &features).await.unwrap();
            assert_eq!(sent > 0, pass == 0);
            hashes.push(rig.engine.status(&target.uuid).unwrap().last_config_hash);
        }
        let status = rig.engine.status(fixtures::LEAF1).unwrap();
        assert_eq!(status.commit_stats.total_commits_sent_since_up, 1);
        assert_eq!(status.state, PushState::Success);
        assert_eq!(status.commit_stats.commit_status_message, "success");
        assert_eq!(status.commit_stats.last_commit_time.len(), "2024-06-01 08:09:10".len());
        assert!(hashes[0].is_some());
        assert!(hashes.iter().all(|h| *h == hashes[0]));
        assert!(rig.engine.last_document(fixtures::LEAF1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_push_ignores_fingerprint() {
        let rig = rig(true, WorkerSettings::default()).await;
        let (target, features) = leaf_features(rig.coord.clone()).await;
        rig.engine.push(&target, &features).await.unwrap();
        rig.engine.force_next_push(&target.uuid);
        assert!(rig.engine.push(&target, &features).await.unwrap() > 0);
        assert_eq!(rig.engine.push(&target, &features).await.unwrap(), 0);
        let status = rig.engine.status(&target.uuid).unwrap();
        assert_eq!(status.commit_stats.total_commits_sent_since_up, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_moves_to_retry_with_backoff() {
        let rig = rig(false, WorkerSettings::default()).await;
        let mut events = rig.hub.subscribe();
        let (target, features) = leaf_features(rig.coord.clone()).await;

        let sent = rig.engine.push(&target, &features).await.unwrap();
        assert!(sent > 0);
        let status = rig.engine.status(&target.uuid).unwrap();
        assert_eq!(status.state, PushState::Retry);
        assert!(status
            .commit_stats
            .commit_status_message
            .starts_with("failed to apply config, router response:"));
        assert_eq!(status.commit_stats.total_commits_sent_since_up, 0);
        assert_eq!(status.last_config_hash, None);
        assert_eq!(status.repush_interval_secs, 30);

        // inside the backoff window nothing is sent
        assert_eq!(rig.engine.push(&target, &features).await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(rig.engine.push(&target, &features).await.unwrap() > 0);
        assert_eq!(rig.engine.status(&target.uuid).unwrap().repush_interval_secs, 60);

        let first: serde_json::Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "push_started");
        let second: serde_json::Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "push_retry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_means_failed() {
        let settings = WorkerSettings {
            fail_templates: ["fabric_config_template".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let rig = rig(true, settings).await;
        let (target, features) = leaf_features(rig.coord.clone()).await;
        rig.engine.send_conf(&target, &features, false, false).await.unwrap();
        let status = rig.engine.status(&target.uuid).unwrap();
        assert_eq!(status.state, PushState::Failed);
        assert!(status.commit_stats.commit_status_message.contains("fabric_config_template failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preconditions_skip_without_error() {
        let rig = rig(true, WorkerSettings::default()).await;
        let (mut target, mut features) = leaf_features(rig.coord.clone()).await;
        target.fabric = None;
        assert_eq!(rig.engine.send_conf(&target, &features, false, true).await.unwrap(), 0);
        target.fabric = Some("fab1".into());
        features.job_template.clear();
        assert_eq!(rig.engine.send_conf(&target, &features, false, true).await.unwrap(), 0);
        assert_eq!(rig.engine.status(&target.uuid), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmanaged_router_gets_config_deleted_once() {
        let rig = rig(true, WorkerSettings::default()).await;
        let (mut target, features) = leaf_features(rig.coord.clone()).await;
        rig.engine.push(&target, &features).await.unwrap();
        assert!(rig.engine.status(&target.uuid).unwrap().config_sent);

        target.vnc_managed = false;
        assert!(rig.engine.push(&target, &features).await.unwrap() > 0);
        let status = rig.engine.status(&target.uuid).unwrap();
        assert!(!status.config_sent);
        assert_eq!(status.state, PushState::Init);
        assert_eq!(status.last_config_hash, None);
        assert_eq!(status.commit_stats.total_commits_sent_since_up, 2);

        assert_eq!(rig.engine.push(&target, &features).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_states_return_to_init() {
        let rig = rig(true, WorkerSettings::default()).await;
        let (mut target, features) = leaf_features(rig.coord.clone()).await;
        assert_eq!(rig.engine.state(&target.uuid), PushState::Init);

        rig.engine.push(&target, &features).await.unwrap();
        assert_eq!(rig.engine.state(&target.uuid), PushState::Success);
        rig.engine.forget(&target.uuid);
        assert_eq!(rig.engine.state(&target.uuid), PushState::Init);

        // back in, then retired through a delete
        rig.engine.push(&target, &features).await.unwrap();
        target.vnc_managed = false;
        rig.engine.push(&target, &features).await.unwrap();
        assert_eq!(rig.engine.state(&target.uuid), PushState::Init);

        // a fresh build after the delete is pushed again
        target.vnc_managed = true;
        assert!(rig.engine.push(&target, &features).await.unwrap() > 0);
        assert_eq!(rig.engine.state(&target.uuid), PushState::Success);
    }

    #[test]
    fn test_push_delay_is_capped() {
        let s = PushSettings::default();
        assert_eq!(s.push_delay(0), Duration::ZERO);
        assert_eq!(s.push_delay(100_000), Duration::from_secs(1));
        assert_eq!(s.push_delay(10_000_000), Duration::from_secs(5));
        let off = PushSettings {
            push_delay_per_kb: 0.0,
            ..Default::default()
        };
        assert_eq!(off.push_delay(10_000_000), Duration::ZERO);
    }
}
