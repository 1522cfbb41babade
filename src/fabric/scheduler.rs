use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::FabricCoordinator;

/// Periodically reconciles every fabric in the current intent
pub struct ReconcileScheduler {
    coordinator: Arc<FabricCoordinator>,
    interval_secs: u64,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ReconcileScheduler {
    pub fn new(coordinator: Arc<FabricCoordinator>, interval_secs: u64) -> Self {
        Self {
            coordinator,
            interval_secs,
            stop_tx: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Start the scheduler; the first pass runs immediately
    pub fn start(&mut self) {
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let coordinator = self.coordinator.clone();
        let interval_secs = self.interval_secs.max(1);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let statuses = coordinator.reconcile_all(false).await;
                        let failed = statuses.iter().filter(|s| s.status == super::FabricState::Failure).count();
                        if failed > 0 {
                            tracing::warn!("{} of {} fabrics failed to reconcile", failed, statuses.len());
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("Reconcile scheduler stopped");
                        break;
                    }
                }
            }
        });
        tracing::info!("Reconcile scheduler started (every {}s)", interval_secs);
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ReconcileScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
