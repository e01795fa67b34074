//! Storage abstraction for operation logs and snapshots.
//!
//! This module defines the [`OperationLog`] trait which abstracts over the
//! storage backends (SQLite, in-memory) used to persist a document's
//! operations, its periodic snapshots, and its client sessions.
//!
//! # Storage Model
//!
//! - **Operation log**: append-only, unique per `(document_id, site_id, counter)`.
//!   The uniqueness constraint is what makes replay idempotent.
//! - **Snapshots**: full document state every N operations, bounding replay.
//! - **Documents**: latest known state per document, for listing/inspection.
//! - **Client sessions**: last reported clock per site, for the GC frontier.

pub mod memory;
pub mod snapshot;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crdt::{DocumentState, Operation, VectorClock};
use crate::error::Result;
use crate::session::ClientSession;

pub use memory::MemoryLog;
pub use snapshot::{SnapshotManager, rebuild};
pub use sqlite::SqliteLog;

/// Result of appending an operation to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The log already holds this `(site_id, counter)`
    Duplicate,
}

/// Full-state checkpoint of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document_id: String,
    /// Number of logged operations covered by this snapshot
    pub operation_count: u64,
    pub crdt_state: DocumentState,
    pub vector_clock: VectorClock,
    pub created_at: DateTime<Utc>,
}

/// Trait for operation log backends.
pub trait OperationLog: Send + Sync {
    /// Appends an operation. A second append of the same operation id is a
    /// replay conflict, reported as `AppendOutcome::Duplicate`.
    fn append(&self, document_id: &str, op: &Operation) -> Result<AppendOutcome>;

    /// Operations not covered by `clock`, in the order they were appended.
    fn operations_after(&self, document_id: &str, clock: &VectorClock) -> Result<Vec<Operation>>;

    /// Number of operations logged for the document.
    fn operation_count(&self, document_id: &str) -> Result<u64>;

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Latest snapshot whose `operation_count` is at most `max_operation_count`
    /// (any snapshot if `None`).
    fn latest_snapshot(
        &self,
        document_id: &str,
        max_operation_count: Option<u64>,
    ) -> Result<Option<Snapshot>>;

    /// Stores the latest state of the document. A state whose clock total
    /// is below the stored one is ignored, so out-of-order writers cannot
    /// move the row backwards.
    fn save_document(&self, document_id: &str, state: &DocumentState) -> Result<()>;

    fn load_document(&self, document_id: &str) -> Result<Option<DocumentState>>;

    /// Ids of every document with logged operations or a stored state.
    fn list_documents(&self) -> Result<Vec<String>>;

    fn save_session(&self, session: &ClientSession) -> Result<()>;

    fn load_sessions(&self, document_id: &str) -> Result<Vec<ClientSession>>;

    fn delete_session(&self, document_id: &str, site_id: &str) -> Result<()>;
}
