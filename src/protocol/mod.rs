//! Wire protocol between sync clients and the server.
//!
//! Every WebSocket binary frame carries exactly one [`Message`]: a one-byte
//! tag followed by the CBOR-encoded payload for that tag (see [`codec`]).
//!
//! # Message flow
//!
//! 1. Client sends `JOIN` with its site id and the clock it has applied.
//! 2. Server answers `SYNCED` with the authoritative document state.
//! 3. Both sides exchange `OPERATION`s; the server fans each applied
//!    operation out to every other peer on the document.
//! 4. Client periodically reports `PROGRESS` so the server knows which
//!    operations it has actually applied. The server answers with a
//!    `PROGRESS` of its own document clock, acknowledging the client's
//!    operations it has logged and applied.
//! 5. Either side may send `ERROR`; a `causal_dependency_missing` error
//!    asks the client to rejoin.

pub mod codec;

use serde::{Deserialize, Serialize};

use crate::crdt::{DocumentState, Operation, SiteId, VectorClock};
use crate::error::{CrdtError, ErrorKind};

pub use codec::{decode, encode};

pub const TAG_JOIN: u8 = 1;
pub const TAG_SYNCED: u8 = 2;
pub const TAG_OPERATION: u8 = 3;
pub const TAG_ERROR: u8 = 4;
pub const TAG_PROGRESS: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub document_id: String,
    pub site_id: SiteId,
    /// What the client has already applied locally
    pub vector_clock: VectorClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synced {
    pub full_state: DocumentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFrame {
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub vector_clock: VectorClock,
}

/// A protocol message, dispatched by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Join(Join),
    Synced(Synced),
    Operation(OperationFrame),
    Error(ErrorFrame),
    Progress(Progress),
}

impl Message {
    pub fn join(
        document_id: impl Into<String>,
        site_id: impl Into<SiteId>,
        vector_clock: VectorClock,
    ) -> Self {
        Message::Join(Join {
            document_id: document_id.into(),
            site_id: site_id.into(),
            vector_clock,
        })
    }

    pub fn synced(full_state: DocumentState) -> Self {
        Message::Synced(Synced { full_state })
    }

    pub fn operation(op: Operation) -> Self {
        Message::Operation(OperationFrame { op })
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Message::Error(ErrorFrame {
            kind,
            message: message.into(),
        })
    }

    pub fn progress(vector_clock: VectorClock) -> Self {
        Message::Progress(Progress { vector_clock })
    }

    pub fn tag(&self) -> u8 {
        match self {
            Message::Join(_) => TAG_JOIN,
            Message::Synced(_) => TAG_SYNCED,
            Message::Operation(_) => TAG_OPERATION,
            Message::Error(_) => TAG_ERROR,
            Message::Progress(_) => TAG_PROGRESS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Join(_) => "JOIN",
            Message::Synced(_) => "SYNCED",
            Message::Operation(_) => "OPERATION",
            Message::Error(_) => "ERROR",
            Message::Progress(_) => "PROGRESS",
        }
    }
}

impl From<&CrdtError> for Message {
    fn from(err: &CrdtError) -> Self {
        Message::error(err.kind(), err.to_string())
    }
}
