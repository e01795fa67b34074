//! Client side of the sync protocol.
//!
//! - [`Replica`]: the local document with editor-offset operations
//! - [`OfflineQueue`]: durable FIFO of unsent local operations
//! - [`Backoff`]: reconnection delays
//! - [`SyncClient`]: the WebSocket connection tying them together

pub mod backoff;
pub mod connection;
pub mod offline_queue;
pub mod replica;

pub use backoff::Backoff;
pub use connection::{ConnectionState, SyncClient};
pub use offline_queue::OfflineQueue;
pub use replica::{RemoteChange, Replica};
