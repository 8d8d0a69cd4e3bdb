mod api;
mod bootstrap;
mod health;
mod providers;
mod qdrant;
#[cfg(test)]
mod test_support;

use std::time::Duration;

use anyhow::{Context, Result};
use ragway_agent::SessionOrchestrator;
use ragway_core::config::{AppConfig, LoadOptions};
use tokio::time::{sleep, Instant};

fn init_logging(config: &AppConfig) {
    use ragway_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let drain_window = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    let router = api::router(api::AppState {
        orchestrator: app.orchestrator.clone(),
        registry: app.registry.clone(),
        versions: app.versions.clone(),
        transcripts: app.transcripts.clone(),
        tools: app.tools.clone(),
    })
    .merge(health::router(health::HealthState {
        db_pool: app.db_pool.clone(),
        registry: app.registry.clone(),
        orchestrator: app.orchestrator.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        address = %address,
        collections = app.registry.collection_ids().len(),
        "ragway-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "ragway-server stopping"
    );
    drain_sessions(&app.orchestrator, drain_window).await;
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_failed",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
}

/// Cancels in-flight requests and gives them a bounded window to persist
/// their partial transcripts.
async fn drain_sessions(orchestrator: &SessionOrchestrator, window: Duration) {
    let cancelled = orchestrator.cancel_all();
    if cancelled == 0 {
        return;
    }
    tracing::info!(
        event_name = "system.server.draining",
        correlation_id = "shutdown",
        cancelled,
        "waiting for in-flight sessions"
    );
    let deadline = Instant::now() + window;
    while orchestrator.active_sessions() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
    let remaining = orchestrator.active_sessions();
    if remaining > 0 {
        tracing::warn!(
            event_name = "system.server.drain_incomplete",
            correlation_id = "shutdown",
            remaining,
            "shutting down with sessions still in flight"
        );
    }
}
