//! # crdt-collab - Collaborative text editing core
//!
//! A replicated document for real-time collaborative text editing, together
//! with the sync protocol, server and client that keep replicas convergent
//! over an unreliable network.
//!
//! ## Features
//!
//! - **Conflict-free**: concurrent inserts and deletes converge on every
//!   replica regardless of delivery order
//! - **Causal delivery**: operations wait in a buffer until what they depend
//!   on has been applied, and replays are idempotent
//! - **Durable**: operations are logged (SQLite or in memory) and documents
//!   are rebuilt from periodic snapshots plus the log tail
//! - **Bounded tombstones**: deleted characters are collected once every
//!   known session has observed the deletion
//! - **Offline editing**: clients queue edits durably while disconnected and
//!   replay them in order after reconnecting
//!
//! ## Example
//!
//! ```rust
//! use crdt_collab::Replica;
//! use std::time::{Duration, Instant};
//!
//! let mut alice = Replica::new("alice", Duration::from_secs(10));
//! let mut bob = Replica::new("bob", Duration::from_secs(10));
//!
//! let op = alice.apply_local_insert(0, 'h').unwrap();
//! bob.receive(op, Instant::now()).unwrap();
//! assert_eq!(bob.text(), "h");
//! ```

pub mod client;
pub mod config;
pub mod crdt;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-export the main public API
pub use client::{Backoff, ConnectionState, OfflineQueue, RemoteChange, Replica, SyncClient};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use crdt::{
    CausalBuffer, CrdtNode, Document, DocumentState, NodeId, Operation, PositionMap, SiteId,
    VectorClock,
};
pub use error::{CrdtError, ErrorKind, Result};
pub use protocol::Message;
pub use server::{DocumentRegistry, create_router};
pub use session::{ClientSession, SessionRegistry};
pub use storage::{MemoryLog, OperationLog, SqliteLog};
