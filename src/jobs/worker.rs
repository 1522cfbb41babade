use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::bus::MessageBus;
use super::types::*;
use crate::coord::CoordClient;
use crate::error::{PipelineError, Result};
use crate::utils::{retry_with_backoff, Backoff};

/// Status publication: 5 attempts, 2s start, 3s step, 15s cap
pub const STATUS_BACKOFF: Backoff = Backoff::new(5, 2, 3, 15);

const FABRIC_LOCK: &str = "fabric-job-monitor";
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

pub const FABRIC_BUSY_MESSAGE: &str =
    "Another job for the same fabric is in progress. Please wait for the job to finish";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_job_count: usize,
    /// Simulated execution time of one job
    pub run_time: Duration,
    /// Templates (joined fq-name or last element) that always fail
    pub fail_templates: BTreeSet<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_job_count: 100,
            run_time: Duration::from_millis(200),
            fail_templates: BTreeSet::new(),
        }
    }
}

/// In-process stand-in for the playbook executor. Consumes `job.request`,
/// runs each job and reports STARTING, IN_PROGRESS and a terminal status.
pub struct JobWorker {
    bus: Arc<dyn MessageBus>,
    coord: Arc<CoordClient>,
    settings: WorkerSettings,
    running: AtomicUsize,
    aborts: Mutex<HashMap<String, CancellationToken>>,
    stop: CancellationToken,
}

impl JobWorker {
    pub fn new(bus: Arc<dyn MessageBus>, coord: Arc<CoordClient>, settings: WorkerSettings) -> Arc<Self> {
        Arc::new(Self {
            bus,
            coord,
            settings,
            running: AtomicUsize::new(0),
            aborts: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        })
    }

    pub fn running_job_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the request and abort consumers, then serve them in the
    /// background until [`JobWorker::stop`].
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut requests = self
            .bus
            .subscribe(JOB_REQUEST_EXCHANGE, JOB_REQUEST_ROUTING_KEY)
            .await?;
        let mut aborts = self
            .bus
            .subscribe(JOB_REQUEST_EXCHANGE, JOB_ABORT_ROUTING_KEY)
            .await?;
        let (request_id, abort_id) = (requests.id, aborts.id);

        let worker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(body) = requests.rx.recv() => worker.clone().on_request(body),
                    Some(body) = aborts.rx.recv() => worker.on_abort(&body),
                    _ = worker.stop.cancelled() => break,
                    else => break,
                }
            }
            worker.bus.unsubscribe(request_id).await;
            worker.bus.unsubscribe(abort_id).await;
            tracing::info!("Job worker stopped");
        });
        tracing::info!("Job worker started (max_job_count={})", self.settings.max_job_count);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn on_request(self: Arc<Self>, body: Vec<u8>) {
        let request: JobRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Dropping undecodable job request: {}", e);
                return;
            }
        };

        if self.running.load(Ordering::SeqCst) >= self.settings.max_job_count {
            tracing::info!("Requeue job request {}", request.job_execution_id);
            let bus = self.bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(REQUEUE_DELAY).await;
                if let Err(e) = bus
                    .publish(JOB_REQUEST_EXCHANGE, JOB_REQUEST_ROUTING_KEY, body)
                    .await
                {
                    tracing::warn!("Failed to requeue job {}: {}", request.job_execution_id, e);
                }
            });
            return;
        }

        self.running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let execution_id = request.job_execution_id.clone();
            if let Err(e) = self.process_job(&request).await {
                tracing::error!("Job {} processing error: {}", execution_id, e);
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn on_abort(&self, body: &[u8]) {
        let abort: JobAbort = match serde_json::from_slice(body) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("Dropping undecodable abort request: {}", e);
                return;
            }
        };
        let aborts = self.aborts.lock().unwrap_or_else(PoisonError::into_inner);
        match aborts.get(&abort.job_execution_id) {
            Some(token) => {
                tracing::info!("ABORT job {} (mode={})", abort.job_execution_id, abort.abort_mode);
                token.cancel();
            }
            None => tracing::debug!("Abort for unknown job {}", abort.job_execution_id),
        }
    }

    async fn process_job(&self, request: &JobRequest) -> Result<()> {
        let execution_id = request.job_execution_id.as_str();

        // Fabric-wide jobs (no device list) run one at a time per fabric
        let fabric_lock = match request.fabric() {
            Some(fabric) if request.params.device_list.is_empty() => {
                let path = self.coord.path(&["job-manager", fabric, FABRIC_LOCK]);
                match self.coord.create_ephemeral(&path, execution_id.as_bytes()).await {
                    Ok(()) => Some(path),
                    Err(PipelineError::NodeExists(_)) => {
                        tracing::warn!("Job {} rejected: fabric {} busy", execution_id, fabric);
                        return self
                            .publish_status(execution_id, JobStatus::Failure, Some(FABRIC_BUSY_MESSAGE.to_string()))
                            .await;
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => None,
        };

        let token = CancellationToken::new();
        self.aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.to_string(), token.clone());

        let result = self.run(request, &token).await;

        self.aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
        if let Some(path) = fabric_lock {
            if let Err(e) = self.coord.delete(&path, false).await {
                tracing::warn!("Failed to release fabric job lock {}: {}", path, e);
            }
        }
        result
    }

    async fn run(&self, request: &JobRequest, token: &CancellationToken) -> Result<()> {
        let execution_id = request.job_execution_id.as_str();
        self.publish_status(execution_id, JobStatus::Starting, None).await?;
        tracing::info!(
            "Running job {} ({}) on {:?}",
            execution_id,
            request.job_template_fq_name.join(":"),
            request.params.device_list
        );
        self.publish_status(execution_id, JobStatus::InProgress, None).await?;

        tokio::select! {
            _ = token.cancelled() => {
                return self
                    .publish_status(execution_id, JobStatus::Failure, Some("job aborted".to_string()))
                    .await;
            }
            _ = tokio::time::sleep(self.settings.run_time) => {}
        }

        let template = request.job_template_fq_name.join(":");
        let short = request.job_template_fq_name.last().cloned().unwrap_or_default();
        if self.settings.fail_templates.contains(&template) || self.settings.fail_templates.contains(&short) {
            let msg = format!("{} failed on {:?}", short, request.params.device_list);
            return self.publish_status(execution_id, JobStatus::Failure, Some(msg)).await;
        }
        self.publish_status(execution_id, JobStatus::Success, Some("success".to_string()))
            .await
    }

    async fn publish_status(&self, execution_id: &str, status: JobStatus, message: Option<String>) -> Result<()> {
        let body = serde_json::to_vec(&JobStatusMessage::new(execution_id, status, message))?;
        let key = status_routing_key(execution_id);
        retry_with_backoff(STATUS_BACKOFF, "job status publish", || {
            self.bus.publish(JOB_STATUS_EXCHANGE, &key, body.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{memory::MemoryBackend, retry::RetryPolicy};
    use crate::jobs::bus::LocalBus;
    use crate::jobs::{DispatcherSettings, JobDispatcher, JobSpec};

    async fn setup(settings: WorkerSettings) -> (Arc<LocalBus>, Arc<CoordClient>, Arc<JobWorker>) {
        let bus = Arc::new(LocalBus::new());
        let coord = CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap();
        let worker = JobWorker::new(bus.clone(), coord.clone(), settings);
        worker.start().await.unwrap();
        (bus, coord, worker)
    }

    fn dispatcher(bus: Arc<LocalBus>) -> JobDispatcher {
        JobDispatcher::new(
            bus,
            DispatcherSettings {
                timeout: Duration::from_secs(1),
                max_retries: 30,
                ..Default::default()
            },
        )
    }

    fn job(template: &str, devices: &[&str]) -> JobSpec {
        JobSpec {
            template: vec!["default-global-system-config".into(), template.into()],
            input: serde_json::json!({"fabric_fq_name": "fab1"}),
            device_list: devices.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_round_trip() {
        let (bus, _, worker) = setup(WorkerSettings::default()).await;
        let out = dispatcher(bus)
            .execute(&job("fabric_config_template", &["pr-1"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.status, JobStatus::Success);
        assert_eq!(out.message.as_deref(), Some("success"));
        tokio::task::yield_now().await;
        assert_eq!(worker.running_job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_template() {
        let settings = WorkerSettings {
            fail_templates: ["broken_template".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let (bus, _, _) = setup(settings).await;
        let err = dispatcher(bus)
            .execute(&job("broken_template", &["pr-1"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "push_transport_failure");
        assert!(err.to_string().contains("broken_template failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fabric_job_rejected_while_locked() {
        let (bus, coord, _) = setup(WorkerSettings::default()).await;
        let lock = coord.path(&["job-manager", "fab1", FABRIC_LOCK]);
        coord.create(&lock, b"other-job").await.unwrap();

        let err = dispatcher(bus)
            .execute(&job("fabric_onboard_template", &[]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Another job for the same fabric"));
        // the foreign lock is left alone
        assert_eq!(coord.read_string(&lock).await.unwrap().as_deref(), Some("other-job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fabric_lock_released_after_job() {
        let (bus, coord, _) = setup(WorkerSettings::default()).await;
        dispatcher(bus)
            .execute(&job("fabric_onboard_template", &[]), &CancellationToken::new())
            .await
            .unwrap();
        let lock = coord.path(&["job-manager", "fab1", FABRIC_LOCK]);
        assert!(!coord.exists(&lock).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_over_max_job_count() {
        let settings = WorkerSettings {
            max_job_count: 1,
            run_time: Duration::from_secs(3),
            ..Default::default()
        };
        let (bus, _, _) = setup(settings).await;
        let d = dispatcher(bus);
        let cancel = CancellationToken::new();
        let job_a = job("fabric_config_template", &["pr-1"]);
        let job_b = job("fabric_config_template", &["pr-2"]);
        let (a, b) = tokio::join!(d.execute(&job_a, &cancel), d.execute(&job_b, &cancel));
        assert_eq!(a.unwrap().status, JobStatus::Success);
        assert_eq!(b.unwrap().status, JobStatus::Success);
    }
}
