//! Main entry point for the collaboration server.
//!
//! Configuration comes from the environment (see [`ServerConfig`]); the
//! operation log is SQLite when `DATABASE_PATH` is set and in memory
//! otherwise.

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crdt_collab::server::{self, DocumentRegistry};
use crdt_collab::{MemoryLog, OperationLog, ServerConfig, SqliteLog};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crdt_collab=info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting collaboration server...");
    let config = ServerConfig::from_env()?;

    let log: Arc<dyn OperationLog> = match &config.database_path {
        Some(path) => {
            info!("Using SQLite operation log at {}", path.display());
            Arc::new(SqliteLog::open(path)?)
        }
        None => {
            warn!("DATABASE_PATH not set; operations are kept in memory only");
            Arc::new(MemoryLog::new())
        }
    };

    let stored = log.list_documents()?;
    if !stored.is_empty() {
        info!("{} stored documents available", stored.len());
    }

    let addr = config.server_addr()?;
    let registry = Arc::new(DocumentRegistry::new(log, config));

    info!("Available endpoints:");
    info!("  GET  /health  - Health check");
    info!("  GET  /ws      - WebSocket sync (binary frames)");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    server::serve(listener, registry).await?;
    Ok(())
}
