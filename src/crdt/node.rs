//! Node definition for the document CRDT.
//!
//! This module contains the CrdtNode struct which represents one character
//! position in the document, live or tombstoned.

use serde::{Deserialize, Serialize};

use crate::crdt::types::NodeId;

/// Represents a single character within the document.
///
/// Each node contains:
/// - A unique identifier (the id of the insert operation that created it)
/// - The character content
/// - Its anchor: the node it was inserted immediately after, at insertion time
/// - A deletion flag that acts as a tombstone for logical deletion
///
/// # Tombstone Deletion
///
/// Deleting a node only sets `deleted`. The node stays in the structure so
/// later operations anchored on it still resolve; only the garbage collector
/// physically removes it once every site has observed the deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtNode {
    pub id: NodeId,
    pub value: char,
    pub deleted: bool,
    /// Anchor at insertion time; `None` means the start of the document
    pub after_id: Option<NodeId>,
    /// Lowest-id delete operation applied to this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<NodeId>,
}

impl CrdtNode {
    /// Creates a new, visible node.
    pub fn new(id: NodeId, value: char, after_id: Option<NodeId>) -> Self {
        CrdtNode {
            id,
            value,
            deleted: false,
            after_id,
            deleted_by: None,
        }
    }

    pub fn is_visible(&self) -> bool {
        !self.deleted
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Marks this node as deleted by `op`.
    ///
    /// Returns false if the node was already a tombstone. Concurrent deletes
    /// keep the lowest deleter id so every replica records the same one.
    pub fn mark_deleted(&mut self, op: NodeId) -> bool {
        if self.deleted {
            if self.deleted_by.as_ref().is_some_and(|current| op < *current) {
                self.deleted_by = Some(op);
            }
            return false;
        }
        self.deleted = true;
        self.deleted_by = Some(op);
        true
    }
}
