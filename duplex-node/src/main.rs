use duplex::ports::TierFactory;
use duplex::CacheManager;
use shared::config::NodeConfig;
use std::sync::Arc;
use std::time::Duration;
use storage_engine::{MemoryTierFactory, RedisTierFactory};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Value = serde_json::Value;

const REAPER_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Duplex node");

    // Load environment variables
    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = NodeConfig::from_env();
    let background = CancellationToken::new();

    let factory: Arc<dyn TierFactory<String, Value>> =
        match RedisTierFactory::connect(&config.redis).await {
            Ok(factory) => Arc::new(factory),
            Err(e) => {
                warn!(error = %e, "Redis unreachable, falling back to in-process tiers");
                let factory = MemoryTierFactory::<Value>::new();
                factory
                    .shared_cache()
                    .start_reaper(REAPER_INTERVAL, background.clone());
                Arc::new(factory)
            }
        };

    let manager: CacheManager<String, Value> = CacheManager::new(config.cache.clone(), factory);
    let cache = manager.get_or_create(&config.cache.name).await?;

    info!(
        cache = %cache.name(),
        node = %cache.node_id(),
        channel = %cache.config().channel,
        "Node ready"
    );

    shutdown_signal().await;

    manager.shutdown().await;
    background.cancel();
    info!("Duplex node stopped");
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
}
