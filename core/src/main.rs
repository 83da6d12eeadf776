/// MeshMS RESTful server - Main entry point
use meshms_core::restful_api::start_restful_api;
use meshms_core::{Config, MemoryStore, MeshmsStore, SledStore};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let store: Arc<dyn MeshmsStore> = match &config.data_dir {
        Some(dir) => {
            info!("Opening MeshMS store in {}", dir.display());
            Arc::new(SledStore::open(dir)?)
        }
        None => {
            info!("No --data-dir given, messages are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    info!("   newsince timeout: {:?}", config.newsince_timeout);
    info!("   newsince poll interval: {:?}", config.newsince_poll_interval);
    if !config.restful_enabled {
        info!("   RESTful interface disabled, every request will be refused");
    }

    tokio::select! {
        result = start_restful_api(config, store) => {
            result.map_err(|e| anyhow::anyhow!("RESTful API error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
