//! SchemaKeeper - multi-engine schema training with live job progress

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use schema_keeper::config::Config;
use schema_keeper::db::Database;
use schema_keeper::models::SCHEMA_REBUILD_JOB;
use schema_keeper::routes;
use schema_keeper::services::worker::Worker;
use schema_keeper::state::AppState;
use schema_keeper::store::Stores;
use schema_keeper::tasks::{heartbeat, maintenance};

/// How often overdue queued jobs are expired
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "schema_keeper=info,tower_http=info".into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Store backend
    let stores = match &config.database_url {
        Some(url) => {
            let db = Database::new(url)
                .await
                .context("Failed to connect to the store database")?;
            Stores::from_backend(Arc::new(db))
        }
        None => {
            warn!("DATABASE_URL not set, using the in-process store; jobs do not survive restarts");
            Stores::memory()
        }
    };

    let state = AppState::new(
        stores,
        config.queue.clone(),
        config.scheduler_mode,
        config.scheduler.clone(),
        config.event_bus_capacity,
    );

    // Spawn background tasks
    let mut worker = Worker::new(state.queue.clone());
    worker.register(
        SCHEMA_REBUILD_JOB,
        state.schema_rebuild_handler(),
        config.worker.clone(),
    );
    worker.start();

    if config.scheduler_enabled {
        state.scheduler.start();
    } else {
        info!("Scheduler disabled");
    }

    let background = [
        tokio::spawn(maintenance::maintenance_task(
            state.queue.clone(),
            MAINTENANCE_PERIOD,
        )),
        tokio::spawn(heartbeat::heartbeat_task(
            state.hub.clone(),
            config.heartbeat_interval,
        )),
    ];

    let app = routes::router(state.clone());

    info!("SchemaKeeper v{} starting on {}", env!("CARGO_PKG_VERSION"), config.listen_addr);
    info!("Store: {}", config.redacted_database_url());
    info!(
        team_size = config.worker.team_size,
        scheduler_mode = ?config.scheduler_mode,
        schedule = ?config.scheduler.schedule,
        "Workers configured"
    );

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let hub = state.hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open SSE streams would otherwise hold the server open
            hub.close_all();
        })
        .await
        .context("Server error")?;

    info!("Shutting down");
    state.scheduler.stop();
    for task in background {
        task.abort();
    }
    worker.shutdown().await;
    state.registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
