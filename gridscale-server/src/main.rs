//! GridScale Server - HTTP API for the sharded time-series store

mod api;

use gridscale_core::grid::{GridConfig, GridScale};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// JSON grid configuration; defaults apply when absent
    pub config_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8086)),
            config_path: None,
        }
    }
}

impl ServerConfig {
    /// `gridscale [config.json] [listen-addr]`
    fn from_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(path) = args.next() {
            config.config_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = args.next() {
            config.http_addr = addr.parse()?;
        }
        Ok(config)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_args(std::env::args().skip(1))?;

    info!("Starting GridScale server...");
    let grid_config = match &config.config_path {
        Some(path) => {
            info!("Grid configuration: {:?}", path);
            GridConfig::from_file(path)?
        }
        None => GridConfig::default(),
    };
    info!("Backend: {:?}, shard sets: {:?}", grid_config.backend, grid_config.shard_sets);

    let grid = Arc::new(GridScale::open(grid_config)?);
    info!("Started {} workers", grid.cardinality());

    let app = api::create_router(grid.clone());

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("GridScale server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down workers");
    grid.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_server_args() {
        let config = ServerConfig::from_args(args(&[])).unwrap();
        assert_eq!(config.http_addr.port(), 8086);
        assert!(config.config_path.is_none());

        let config = ServerConfig::from_args(args(&["grid.json", "127.0.0.1:9000"])).unwrap();
        assert_eq!(config.config_path, Some(PathBuf::from("grid.json")));
        assert_eq!(config.http_addr.port(), 9000);

        assert!(ServerConfig::from_args(args(&["grid.json", "not-an-addr"])).is_err());
    }
}
