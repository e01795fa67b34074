//! Error types shared by the document engine, storage, and sync layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::NodeId;

/// Coarse classification of a [`CrdtError`].
///
/// This is what travels over the wire inside an `ERROR` frame and what the
/// sync layer branches on (e.g. a `CausalDependencyMissing` from the server
/// makes the client rejoin for a full resync).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidOperation,
    CausalDependencyMissing,
    DuplicateOperation,
    Transport,
    ReplayConflict,
    Storage,
}

/// Unified error type for the collaborative document core.
#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation {op} depends on {missing}, which is not present")]
    CausalDependencyMissing { op: NodeId, missing: NodeId },

    #[error("operation {0} was already applied")]
    DuplicateOperation(NodeId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation {0} is already in the operation log")]
    ReplayConflict(NodeId),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(String),
}

impl CrdtError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrdtError::InvalidOperation(_) | CrdtError::Codec(_) => ErrorKind::InvalidOperation,
            CrdtError::CausalDependencyMissing { .. } => ErrorKind::CausalDependencyMissing,
            CrdtError::DuplicateOperation(_) => ErrorKind::DuplicateOperation,
            CrdtError::Transport(_) => ErrorKind::Transport,
            CrdtError::ReplayConflict(_) => ErrorKind::ReplayConflict,
            CrdtError::Storage(_) | CrdtError::Serialization(_) | CrdtError::Io(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Duplicates and replay conflicts are the same thing seen from two layers
    /// and are never reported to the editor.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            CrdtError::DuplicateOperation(_) | CrdtError::ReplayConflict(_)
        )
    }
}

/// Result type alias for document core operations
pub type Result<T> = std::result::Result<T, CrdtError>;
