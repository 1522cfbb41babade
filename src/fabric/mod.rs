//! Fabric coordinator: owns the current intent snapshot and drives
//! onboarding, role assignment and per-router reconcile for each fabric.

pub mod namespaces;
pub mod scheduler;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinSet;

use crate::composer::{Composer, DeviceAllocations};
use crate::coord::CoordClient;
use crate::error::{PipelineError, Result};
use crate::events::{Event, EventType, Hub};
use crate::intent::{FabricId, Graph, IntentObject, PrId};
use crate::push::{PushEngine, PushState, PushTarget};
use crate::utils::format_timestamp;
use namespaces::{write_json, FabricPools};
pub use scheduler::ReconcileScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FabricState {
    Success,
    Failure,
}

impl FabricState {
    pub fn as_str(self) -> &'static str {
        match self {
            FabricState::Success => "success",
            FabricState::Failure => "failure",
        }
    }
}

/// Outcome of the last reconcile pass over one fabric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FabricStatus {
    pub name: String,
    pub status: FabricState,
    pub devices: BTreeMap<String, PushState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<String>,
}

/// Role record written per router during role assignment
#[derive(Debug, Clone, Serialize)]
struct RoleRecord<'a> {
    physical_role: Option<&'a str>,
    routing_bridging_roles: &'a [String],
    node_profile: Option<&'a str>,
}

struct IntentSnapshot {
    objects: Vec<IntentObject>,
    graph: Arc<Graph>,
}

pub struct FabricCoordinator {
    coord: Arc<CoordClient>,
    composer: Arc<Composer>,
    engine: Arc<PushEngine>,
    ws_hub: Option<Arc<Hub>>,
    intent: RwLock<Arc<IntentSnapshot>>,
    statuses: RwLock<BTreeMap<String, FabricStatus>>,
    fabric_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FabricCoordinator {
    pub fn new(
        coord: Arc<CoordClient>,
        composer: Arc<Composer>,
        engine: Arc<PushEngine>,
        ws_hub: Option<Arc<Hub>>,
    ) -> Self {
        Self {
            coord,
            composer,
            engine,
            ws_hub,
            intent: RwLock::new(Arc::new(IntentSnapshot {
                objects: Vec::new(),
                graph: Arc::new(Graph::default()),
            })),
            statuses: RwLock::new(BTreeMap::new()),
            fabric_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<PushEngine> {
        &self.engine
    }

    fn snapshot(&self) -> Arc<IntentSnapshot> {
        self.intent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Graph every reconcile pass started from now will use
    pub fn graph(&self) -> Arc<Graph> {
        self.snapshot().graph.clone()
    }

    pub fn fabric_names(&self) -> Vec<String> {
        self.graph().fabrics().map(|(_, f)| f.name()).collect()
    }

    pub fn fabric_status(&self, name: &str) -> Option<FabricStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Validate and swap in a new intent. On error the current intent stays.
    pub async fn install_intent(&self, objects: Vec<IntentObject>) -> Result<usize> {
        let count = objects.len();
        self.replace_intent(objects)?;
        tracing::info!("Installed intent with {} objects", count);
        if let Some(ref hub) = self.ws_hub {
            hub.broadcast_event(Event {
                event_type: EventType::IntentUpdated,
                payload: serde_json::json!({ "objects": count }),
            })
            .await;
        }
        Ok(count)
    }

    fn replace_intent(&self, objects: Vec<IntentObject>) -> Result<()> {
        let snapshot = Self::validated_snapshot(objects)?;
        *self.intent.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }

    fn validated_snapshot(objects: Vec<IntentObject>) -> Result<Arc<IntentSnapshot>> {
        let graph = Graph::build_validated(objects.clone())?;
        Ok(Arc::new(IntentSnapshot {
            objects,
            graph: Arc::new(graph),
        }))
    }

    /// Add discovered PI -> PI links in both directions. Links already
    /// present are left alone; returns how many pairs were new.
    ///
    /// The intent write lock is held from read to swap, so an install
    /// racing with an import is never overwritten by a stale copy.
    pub fn import_topology(&self, links: &[(String, String)]) -> Result<usize> {
        let mut intent = self.intent.write().unwrap_or_else(PoisonError::into_inner);
        let mut objects = intent.objects.clone();
        let positions: HashMap<String, usize> = objects
            .iter()
            .enumerate()
            .filter(|(_, o)| matches!(o, IntentObject::PhysicalInterface(_)))
            .map(|(i, o)| (o.uuid().to_string(), i))
            .collect();

        let mut added = 0;
        for (a, b) in links {
            let mut new_pair = false;
            for (from, to) in [(a, b), (b, a)] {
                let i = *positions.get(from.as_str()).ok_or_else(|| {
                    PipelineError::BadRequest(format!("topology refers to unknown physical-interface {}", from))
                })?;
                if let IntentObject::PhysicalInterface(ref mut pi) = objects[i] {
                    if !pi.links.contains(to) {
                        pi.links.push(to.clone());
                        new_pair = true;
                    }
                }
            }
            if new_pair {
                added += 1;
            }
        }

        if added > 0 {
            *intent = Self::validated_snapshot(objects)?;
            tracing::info!("Imported {} new links", added);
        }
        Ok(added)
    }

    fn fabric_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.fabric_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn fabric_id(graph: &Graph, name: &str) -> Result<FabricId> {
        graph
            .fabric_by_name(name)
            .ok_or_else(|| PipelineError::NotFound(format!("fabric {}", name)))
    }

    /// Register namespaces and open the fabric's pools
    pub async fn onboard(&self, name: &str) -> Result<FabricPools> {
        let graph = self.graph();
        let fabric_id = Self::fabric_id(&graph, name)?;
        namespaces::onboard(&self.coord, &graph, graph.fabric(fabric_id)).await
    }

    /// Write role records for every router of the fabric. Each write
    /// stands on its own; a failure is reported, never rolled back, and
    /// marks the fabric `failure` until the next reconcile pass.
    pub async fn assign_roles(&self, name: &str) -> Result<bool> {
        let lock = self.fabric_lock(name);
        let _pass = lock.lock().await;

        let graph = self.graph();
        let fabric_id = Self::fabric_id(&graph, name)?;
        let ok = self.write_roles(&graph, fabric_id).await;
        if !ok {
            self.statuses
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name.to_string())
                .and_modify(|s| s.status = FabricState::Failure)
                .or_insert_with(|| FabricStatus {
                    name: name.to_string(),
                    status: FabricState::Failure,
                    devices: BTreeMap::new(),
                    last_reconcile: None,
                });
            if let Some(ref hub) = self.ws_hub {
                hub.broadcast_fabric(name, FabricState::Failure.as_str(), 0).await;
            }
        }
        Ok(ok)
    }

    async fn write_roles(&self, graph: &Graph, fabric_id: FabricId) -> bool {
        let fabric = graph.fabric(fabric_id);
        let name = fabric.name();
        let mut ok = true;
        for &pr_id in &fabric.physical_routers {
            let router = graph.pr(pr_id);
            let record = RoleRecord {
                physical_role: router.props.physical_role.as_deref(),
                routing_bridging_roles: &router.props.routing_bridging_roles,
                node_profile: router
                    .node_profile
                    .map(|np| graph.node_profile(np).props.uuid.as_str()),
            };
            let path = self.coord.path(&["roles", &name, router.uuid()]);
            if let Err(e) = write_json(&self.coord, &path, &record).await {
                tracing::warn!("Role assignment for {} failed: {}", router.name(), e);
                ok = false;
            }
        }
        ok
    }

    /// One reconcile pass over a fabric: onboard, assign roles, then build
    /// and push every router concurrently. The fabric ends up `failure` if
    /// any step for any router failed.
    pub async fn reconcile(&self, name: &str, force: bool) -> Result<FabricStatus> {
        let lock = self.fabric_lock(name);
        let _pass = lock.lock().await;

        let graph = self.graph();
        let fabric_id = Self::fabric_id(&graph, name)?;
        let fabric = graph.fabric(fabric_id);
        let pools = namespaces::onboard(&self.coord, &graph, fabric).await?;
        let mut failed = !self.write_roles(&graph, fabric_id).await;

        let live: BTreeSet<String> = fabric
            .physical_routers
            .iter()
            .map(|pr| graph.pr(*pr).uuid().to_string())
            .collect();
        if let Err(e) = pools.release_unused(&live).await {
            tracing::warn!("Releasing unused allocations of {} failed: {}", name, e);
        }

        let mut tasks = JoinSet::new();
        for &pr_id in &fabric.physical_routers {
            let router = graph.pr(pr_id);
            let allocations = match pools.allocations_for(router).await {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!("Fabric allocations for {} failed: {}", router.name(), e);
                    failed = true;
                    DeviceAllocations::default()
                }
            };
            if force {
                self.engine.force_next_push(router.uuid());
            }
            let graph = graph.clone();
            let composer = self.composer.clone();
            let engine = self.engine.clone();
            tasks.spawn(async move {
                let target = PushTarget::from_graph(&graph, pr_id);
                let result = reconcile_device(&composer, &engine, &graph, pr_id, &target, &allocations).await;
                (target, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((target, Err(e))) => {
                    tracing::warn!("Reconcile of {} failed: {}", target.name, e);
                    failed = true;
                }
                Err(e) => {
                    tracing::error!("Reconcile task aborted: {}", e);
                    failed = true;
                }
            }
        }

        let mut devices = BTreeMap::new();
        for uuid in &live {
            let state = self.engine.state(uuid);
            failed |= state.is_failure();
            devices.insert(uuid.clone(), state);
        }

        let status = FabricStatus {
            name: name.to_string(),
            status: if failed { FabricState::Failure } else { FabricState::Success },
            devices,
            last_reconcile: Some(format_timestamp(chrono::Utc::now())),
        };

        let previous = self
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), status.clone());
        if let Some(previous) = previous {
            for uuid in previous.devices.keys().filter(|u| !live.contains(*u)) {
                tracing::info!("Router {} left fabric {}", uuid, name);
                self.engine.forget(uuid);
            }
        }

        tracing::info!(
            "Reconciled fabric {}: {} ({} devices)",
            name,
            status.status.as_str(),
            status.devices.len()
        );
        if let Some(ref hub) = self.ws_hub {
            hub.broadcast_fabric(name, status.status.as_str(), status.devices.len())
                .await;
        }
        Ok(status)
    }

    /// Reconcile every fabric in the current intent
    pub async fn reconcile_all(&self, force: bool) -> Vec<FabricStatus> {
        let mut out = Vec::new();
        for name in self.fabric_names() {
            match self.reconcile(&name, force).await {
                Ok(status) => out.push(status),
                Err(e) => tracing::warn!("Reconcile of fabric {} failed: {}", name, e),
            }
        }
        out
    }
}

async fn reconcile_device(
    composer: &Composer,
    engine: &PushEngine,
    graph: &Graph,
    pr_id: PrId,
    target: &PushTarget,
    allocations: &DeviceAllocations,
) -> Result<usize> {
    let features = composer.build(graph, pr_id, allocations).await?;
    let sent = engine.push(target, &features).await?;
    if !features.device.is_empty() {
        let freed = composer
            .ae_pool()
            .release_unused(&target.uuid, &features.esis)
            .await?;
        if !freed.is_empty() {
            tracing::info!("Released AE ids {:?} on {}", freed, target.name);
        }
    }
    Ok(sent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coord::{memory::MemoryBackend, retry::RetryPolicy};
    use crate::intent::fixtures;
    use crate::jobs::bus::LocalBus;
    use crate::jobs::worker::{JobWorker, WorkerSettings};
    use crate::jobs::{DispatcherSettings, JobDispatcher};
    use crate::push::PushSettings;
    use std::time::Duration;

    pub(crate) async fn coordinator() -> Arc<FabricCoordinator> {
        let coord = CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap();
        let bus = Arc::new(LocalBus::new());
        JobWorker::new(bus.clone(), coord.clone(), WorkerSettings::default())
            .start()
            .await
            .unwrap();
        let dispatcher = Arc::new(JobDispatcher::new(
            bus,
            DispatcherSettings {
                timeout: Duration::from_secs(1),
                max_retries: 5,
                ..Default::default()
            },
        ));
        let engine = Arc::new(PushEngine::new(dispatcher, PushSettings::default(), None));
        let composer = Arc::new(Composer::new(coord.clone(), 128));
        Arc::new(FabricCoordinator::new(coord, composer, engine, None))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_pushes_every_router_once() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();

        let status = fc.reconcile("fab1", false).await.unwrap();
        assert_eq!(status.status, FabricState::Success);
        assert_eq!(status.devices.len(), 3);
        assert!(status.devices.values().all(|s| *s == PushState::Success));

        // unchanged intent: nothing new is committed
        fc.reconcile("fab1", false).await.unwrap();
        for uuid in [fixtures::SPINE, fixtures::LEAF1, fixtures::LEAF2] {
            let s = fc.engine().status(uuid).unwrap();
            assert_eq!(s.commit_stats.total_commits_sent_since_up, 1, "{}", uuid);
        }

        // forced pass commits again
        fc.reconcile("fab1", true).await.unwrap();
        let s = fc.engine().status(fixtures::LEAF1).unwrap();
        assert_eq!(s.commit_stats.total_commits_sent_since_up, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciled_leaf_peers_with_rr_and_other_leaf() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();
        fc.reconcile("fab1", false).await.unwrap();

        let doc = fc.engine().last_document(fixtures::LEAF1).unwrap();
        let text = doc.to_string();
        assert!(text.contains("_contrail_asn-64512"));
        assert!(text.contains("10.10.0.1"));
        assert!(text.contains("10.10.0.3"));
        let spine = fc.engine().last_document(fixtures::SPINE).unwrap().to_string();
        assert!(spine.contains("_contrail_asn-64512-rr"));
    }

    #[tokio::test]
    async fn test_unknown_fabric_is_not_found() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();
        let err = fc.reconcile("nope", false).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_invalid_intent_keeps_previous() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();
        let before = fc.graph().object_count();

        let mut broken = fixtures::fabric_objects();
        broken.push(IntentObject::PhysicalInterface(crate::intent::PhysicalInterfaceObject {
            uuid: "pi-orphan".into(),
            fq_name: vec!["x".into(), "pi-orphan".into()],
            physical_router: "pr-missing".into(),
            ..Default::default()
        }));
        let err = fc.install_intent(broken).await.unwrap_err();
        assert_eq!(err.kind(), "bad_request");
        assert_eq!(fc.graph().object_count(), before);
    }

    #[tokio::test]
    async fn test_topology_import_is_idempotent() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();
        let links = vec![("pi-1".to_string(), "pi-native".to_string())];

        assert_eq!(fc.import_topology(&links).unwrap(), 1);
        assert_eq!(fc.import_topology(&links).unwrap(), 0);

        let g = fc.graph();
        let pi1 = g.pi_by_uuid("pi-1").unwrap();
        let native = g.pi_by_uuid("pi-native").unwrap();
        assert_eq!(g.pi(pi1).links, vec![native]);
        assert_eq!(g.pi(native).links, vec![pi1]);

        let unknown = vec![("pi-1".to_string(), "pi-404".to_string())];
        assert_eq!(fc.import_topology(&unknown).unwrap_err().kind(), "bad_request");
    }

    #[tokio::test]
    async fn test_roles_written_per_router() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();
        assert!(fc.assign_roles("fab1").await.unwrap());

        let path = fc.coord.path(&["roles", "fab1", fixtures::SPINE]);
        let record: serde_json::Value =
            serde_json::from_str(&fc.coord.read_string(&path).await.unwrap().unwrap()).unwrap();
        assert_eq!(record["physical_role"], "spine");
        assert_eq!(record["node_profile"], "np-1");
        assert_eq!(fc.coord.children(&fc.coord.path(&["roles", "fab1"])).await.unwrap().len(), 3);
        assert!(fc.fabric_status("fab1").is_none());
    }

    #[tokio::test]
    async fn test_failed_role_assignment_marks_fabric_failure() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();
        fc.coord.on_lost(Arc::new(|| {}));
        fc.coord.expire_session();

        assert!(!fc.assign_roles("fab1").await.unwrap());
        let status = fc.fabric_status("fab1").unwrap();
        assert_eq!(status.status, FabricState::Failure);
        assert!(status.last_reconcile.is_none());
    }

    #[tokio::test]
    async fn test_topology_import_applies_to_latest_intent() {
        let fc = coordinator().await;
        fc.install_intent(fixtures::fabric_objects()).await.unwrap();
        let links = vec![("pi-1".to_string(), "pi-native".to_string())];
        fc.import_topology(&links).unwrap();

        // a reinstall drops the imported link; a later import sees the new objects
        let mut objects = fixtures::fabric_objects();
        objects.push(IntentObject::Fabric(crate::intent::FabricObject {
            uuid: "fab-2".into(),
            fq_name: vec!["default-global-system-config".into(), "fab2".into()],
            ..Default::default()
        }));
        let count = objects.len();
        fc.install_intent(objects).await.unwrap();
        assert_eq!(fc.import_topology(&links).unwrap(), 1);

        let g = fc.graph();
        assert_eq!(g.object_count(), count);
        assert!(fc.fabric_names().contains(&"fab2".to_string()));
        let pi1 = g.pi_by_uuid("pi-1").unwrap();
        assert_eq!(g.pi(pi1).links.len(), 1);
    }

    #[test]
    fn test_install_survives_concurrent_import() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let fc = coordinator().await;
            fc.install_intent(fixtures::fabric_objects()).await.unwrap();
            let links = vec![("pi-1".to_string(), "pi-native".to_string())];
            for _ in 0..50 {
                let importer = fc.clone();
                let import_links = links.clone();
                let import = tokio::task::spawn_blocking(move || importer.import_topology(&import_links));
                let mut objects = fixtures::fabric_objects();
                objects.push(IntentObject::Fabric(crate::intent::FabricObject {
                    uuid: "fab-2".into(),
                    fq_name: vec!["default-global-system-config".into(), "fab2".into()],
                    ..Default::default()
                }));
                fc.install_intent(objects).await.unwrap();
                import.await.unwrap().unwrap();
                // whichever ran last, the installed fabric is never lost
                assert!(fc.fabric_names().contains(&"fab2".to_string()));
                fc.install_intent(fixtures::fabric_objects()).await.unwrap();
            }
        });
    }
}
