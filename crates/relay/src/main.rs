use clap::Parser;
use jobpulse_observability::{init_tracing, DEFAULT_FILTER};
use jobpulse_relay::config::RelayConfig;
use jobpulse_relay::listener::spawn_update_listener;
use jobpulse_relay::state::RelayState;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::parse();
    init_tracing(config.log_format, DEFAULT_FILTER)?;

    if config.metrics {
        jobpulse_relay::metrics::init_metrics();
    }

    let store = jobpulse_relay::connect_store(&config.store_url).await?;
    let state = RelayState::new(store, config.fanout.clone());
    let updates = spawn_update_listener(state.clone());
    let app = jobpulse_relay::app(state);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!("Relay server listening on {}", config.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    updates.abort();
    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
