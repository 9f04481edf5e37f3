use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ride_dispatch::api;
use ride_dispatch::clock::SystemClock;
use ride_dispatch::config::{DispatchSettings, ServerConfig};
use ride_dispatch::engine::scheduler::spawn_ticker;
use ride_dispatch::error::DispatchError;
use ride_dispatch::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    let config = ServerConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let settings = DispatchSettings::load(config.dispatch_config.as_deref().map(Path::new))?;
    tracing::info!(
        enabled = settings.enabled,
        max_rounds = settings.rounds.max_rounds,
        "dispatch settings loaded"
    );

    let shared_state = Arc::new(AppState::start(
        settings,
        Arc::new(SystemClock::new()),
        config.shard_count,
        config.command_queue_size,
        config.event_buffer_size,
    ));

    let ticker = spawn_ticker(
        shared_state.dispatcher.clone(),
        Duration::from_millis(config.tick_interval_ms.max(1)),
    );

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| DispatchError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| DispatchError::Internal(format!("server error: {err}")))?;

    ticker.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
