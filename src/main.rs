use anyhow::Result;
use turnstile::config::Config;
use turnstile::handlers::AppState;
use turnstile::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Reads .env, environment variables and flags
    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("turnstile={},tower_http=info", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting turnstile service");
    tracing::info!(
        "Configuration: bind_address={}, key_strategy={:?}, max_clients={}, drain_timeout={}",
        config.bind_address,
        config.key_strategy,
        config.max_clients,
        humantime::format_duration(config.drain_timeout),
    );

    let server = Server::new(AppState::new(config));
    let report = server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    if report.is_forced() {
        tracing::warn!(
            interrupted = report.interrupted.len(),
            "Shutdown forced with requests still in flight"
        );
    } else {
        tracing::info!("Server gracefully stopped");
    }

    Ok(())
}
