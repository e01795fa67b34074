//! Web server module for the collaboration service.
//!
//! This module contains the Axum server: the WebSocket endpoint, the
//! registry of open documents, and the per-document actors behind it.

pub mod actor;
pub mod registry;
pub mod routes;
pub mod websocket;

use tokio::net::TcpListener;
use tracing::info;

pub use actor::{DocumentActor, DocumentHandle, DocumentStats};
pub use registry::DocumentRegistry;
pub use routes::{AppState, HealthResponse, create_router};

/// Serves the collaboration routes on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Server listening on http://{}", addr);
    }
    axum::serve(listener, create_router(state)).await
}
