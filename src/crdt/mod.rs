//! CRDT (Conflict-free Replicated Data Type) implementation module.
//!
//! This module contains the replicated document and all its supporting
//! pieces: identifiers and clocks, operations, causal delivery, the offset
//! bridge used by editors, and tombstone collection.

pub mod causal;
pub mod document;
pub mod gc;
pub mod node;
pub mod operation;
pub mod position_map;
pub mod types;

// Re-export the main public API
pub use causal::CausalBuffer;
pub use document::{Applied, Document, DocumentState};
pub use node::CrdtNode;
pub use operation::{Operation, OperationType, RawOperation};
pub use position_map::PositionMap;
pub use types::{NodeId, SiteId, VectorClock};
