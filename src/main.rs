use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fabric_push::config::Config;
use fabric_push::fabric::ReconcileScheduler;
use fabric_push::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fabric_push=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::load();
    tracing::info!("Starting Fabric Push");
    tracing::info!("Coordination store: {} ({})", cfg.coord_backend, cfg.coord_db_path);
    tracing::info!("Base path: {}", cfg.coord_base_path);
    tracing::info!("Listen: {}", cfg.listen_addr);

    let state = AppState::build(cfg.clone()).await?;

    match state.load_intent_file().await? {
        Some(count) => tracing::info!("Loaded {} intent objects from {}", count, cfg.intent_path),
        None => tracing::info!("No INTENT_PATH set; waiting for POST /api/intent"),
    }

    let mut scheduler = ReconcileScheduler::new(state.coordinator.clone(), cfg.reconcile_interval_secs);
    scheduler.start();

    let app = router::build(state.clone());

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!("Fabric Push listening on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Fabric Push shutting down");
    scheduler.stop();
    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
