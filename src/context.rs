use anyhow::Context;
use std::sync::Arc;

use crate::composer::Composer;
use crate::config::{coord_backend, Config};
use crate::coord::{memory::MemoryBackend, retry::RetryPolicy, sqlite::SqliteBackend, CoordBackend, CoordClient};
use crate::events::Hub;
use crate::fabric::FabricCoordinator;
use crate::intent::TypeRegistry;
use crate::jobs::bus::{LocalBus, MessageBus};
use crate::jobs::worker::JobWorker;
use crate::jobs::JobDispatcher;
use crate::push::PushEngine;

/// Application state shared across handlers and background tasks.
/// Every component hangs off one value so tests can run several
/// independent pipelines side by side.
pub struct AppState {
    pub config: Config,
    pub coord: Arc<CoordClient>,
    pub registry: TypeRegistry,
    pub coordinator: Arc<FabricCoordinator>,
    pub engine: Arc<PushEngine>,
    pub ws_hub: Option<Arc<Hub>>,
    pub job_worker: Option<Arc<JobWorker>>,
}

impl AppState {
    /// Open the configured coordination store and wire the pipeline
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let backend: Arc<dyn CoordBackend> = match config.coord_backend.as_str() {
            coord_backend::MEMORY => Arc::new(MemoryBackend::new()),
            coord_backend::SQLITE => Arc::new(
                SqliteBackend::open(&config.coord_db_path, config.coord_max_connections).await?,
            ),
            other => anyhow::bail!("unknown COORD_BACKEND {:?}", other),
        };
        Self::with_backend(config, backend).await
    }

    pub async fn with_backend(config: Config, backend: Arc<dyn CoordBackend>) -> anyhow::Result<Arc<Self>> {
        let coord = CoordClient::connect(backend, &config.coord_base_path, RetryPolicy::default())
            .await
            .context("Failed to connect to coordination store")?;
        let ws_hub = Arc::new(Hub::new());
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());

        let job_worker = if config.simulate_job_worker {
            let worker = JobWorker::new(bus.clone(), coord.clone(), config.worker_settings());
            worker.start().await.context("Failed to start job worker")?;
            Some(worker)
        } else {
            tracing::warn!("No in-process job worker; pushes wait for an external one");
            None
        };

        let dispatcher = Arc::new(JobDispatcher::new(bus, config.dispatcher_settings()));
        let engine = Arc::new(PushEngine::new(
            dispatcher,
            config.push_settings(),
            Some(ws_hub.clone()),
        ));
        let composer = Arc::new(Composer::new(coord.clone(), config.max_ae_device_count));
        let coordinator = Arc::new(FabricCoordinator::new(
            coord.clone(),
            composer,
            engine.clone(),
            Some(ws_hub.clone()),
        ));

        Ok(Arc::new(Self {
            config,
            coord,
            registry: TypeRegistry::standard(),
            coordinator,
            engine,
            ws_hub: Some(ws_hub),
            job_worker,
        }))
    }

    /// Decode, validate and install an intent snapshot document
    pub async fn install_intent_document(&self, json: &str) -> crate::error::Result<usize> {
        let objects = self.registry.decode_document(json)?;
        self.coordinator.install_intent(objects).await
    }

    /// Load the snapshot at `INTENT_PATH`, if one is configured
    pub async fn load_intent_file(&self) -> anyhow::Result<Option<usize>> {
        if self.config.intent_path.is_empty() {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&self.config.intent_path)
            .await
            .with_context(|| format!("Failed to read intent file {}", self.config.intent_path))?;
        let count = self
            .install_intent_document(&json)
            .await
            .with_context(|| format!("Invalid intent file {}", self.config.intent_path))?;
        Ok(Some(count))
    }

    /// Stop background work and release the coordination session
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        if let Some(ref worker) = self.job_worker {
            worker.stop();
        }
        if let Err(e) = self.coord.close().await {
            tracing::warn!("Closing coordination session failed: {}", e);
        }
    }
}
