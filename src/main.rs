use aerogate::config::Config;
use aerogate::server::Server;
use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("aerogate={},tower_http=debug", default_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Aviationstack gateway");
    tracing::info!(
        "Configuration: bind={}:{}, redis_url={}, upstream={}, cache_ttl={}s, quota={}",
        config.server_host,
        config.server_port,
        config.redis_url,
        config.upstream_base_url,
        config.cache_ttl_secs,
        config.monthly_quota
    );

    // Create and run the server
    let server = Server::new(config);

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
