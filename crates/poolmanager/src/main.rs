//! poolmanager — agent pool control loop.
//!
//! Loads configuration from the environment, starts the reconciler's tick
//! loop (and, if configured, its heartbeat sweep) as background tasks, and
//! serves the control-plane HTTP API until interrupted.

use pool_config::Settings;
use pool_observe::{AuditLog, PoolMetrics};
use pool_provider::HttpProvider;
use pool_reconcile::{HeartbeatTracker, Reconciler};
use pool_store::MetadataStore;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("poolmanager=info,pool_reconcile=info")))
        .init();

    let settings = Settings::from_env()?;
    info!(
        environment = %settings.environment_tag,
        min_idle = settings.min_idle,
        max_total = settings.max_total,
        "loaded configuration"
    );

    std::fs::create_dir_all(&settings.state_dir)?;

    let provider = Arc::new(HttpProvider::new(
        settings.provider_api_base.clone(),
        settings.provider_token.clone(),
        settings.provider_project_id.clone(),
        settings.provider_environment_id.clone(),
        settings.source_image.clone(),
        settings.deploy_commit.clone(),
    ));
    let store = Arc::new(MetadataStore::new(&settings.state_dir));
    let cache = Arc::new(pool_reconcile::PoolCache::new());
    let metrics = Arc::new(PoolMetrics::new());
    let audit = Arc::new(AuditLog::default_capacity());

    let port = settings.port;
    let bearer_token = settings.bearer_token.clone();
    let environment_tag = settings.environment_tag.clone();
    let tick_interval = settings.tick_interval;
    let heartbeat_interval = settings.heartbeat_interval;

    let reconciler = Arc::new(Reconciler::new(provider, store, cache, settings, metrics, audit));

    let tick_reconciler = Arc::clone(&reconciler);
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            let outcome = tick_reconciler.tick().await;
            info!(?outcome, "tick loop iteration complete");
        }
    });

    let heartbeat_task = heartbeat_interval.map(|period| {
        let heartbeat_reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            let tracker = HeartbeatTracker::new();
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                heartbeat_reconciler.heartbeat_sweep(&tracker).await;
            }
        })
    });

    let app = pool_api::build_app(Arc::clone(&reconciler), bearer_token, environment_tag);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "control-plane API listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tick_task.abort();
    if let Some(task) = heartbeat_task {
        task.abort();
    }

    if let Err(e) = serve_result {
        error!(error = %e, "http server exited with error");
        return Err(e.into());
    }

    info!("poolmanager shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
