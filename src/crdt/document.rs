//! Core document CRDT implementation.
//!
//! This module contains the `Document` struct: an ordered list of characters
//! with tombstones, where every node remembers the anchor it was inserted
//! after. Nodes live in an arena keyed by [`NodeId`]; the order is a tree of
//! anchors whose pre-order walk is the visible text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::crdt::node::CrdtNode;
use crate::crdt::operation::Operation;
use crate::crdt::types::{NodeId, VectorClock};
use crate::error::{CrdtError, Result};

/// Outcome of applying an operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    /// Already applied earlier; the document is unchanged
    Duplicate,
}

/// Serialized form of a [`Document`].
///
/// Nodes are listed in pre-order (tombstones included), so every anchor
/// precedes the nodes inserted after it and the list can be replayed as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub nodes: Vec<CrdtNode>,
    pub vector_clock: VectorClock,
}

/// The replicated document.
///
/// # Design
///
/// - Arena of nodes in a `HashMap<NodeId, CrdtNode>`; links are ids, never references
/// - For each anchor, its children sorted by `NodeId` descending
/// - Tombstone-based deletion; only garbage collection removes nodes
/// - A vector clock of the highest counter applied per site
///
/// Because sibling order depends only on ids, every replica that has applied
/// the same set of operations produces the same linearization, whatever the
/// delivery order was.
#[derive(Debug, Clone, Default)]
pub struct Document {
    nodes: HashMap<NodeId, CrdtNode>,
    /// Children of the document start
    roots: Vec<NodeId>,
    children: HashMap<NodeId, Vec<NodeId>>,
    clock: VectorClock,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a document from its serialized state.
    pub fn from_state(state: DocumentState) -> Result<Self> {
        let mut document = Document::new();
        for node in state.nodes {
            if document.nodes.contains_key(&node.id) {
                return Err(CrdtError::InvalidOperation(format!(
                    "node {} appears twice in document state",
                    node.id
                )));
            }
            if let Some(anchor) = &node.after_id {
                if !document.nodes.contains_key(anchor) {
                    return Err(CrdtError::CausalDependencyMissing {
                        op: node.id.clone(),
                        missing: anchor.clone(),
                    });
                }
            }
            document.clock.observe(&node.id.site_id, node.id.counter);
            if let Some(deleter) = &node.deleted_by {
                document.clock.observe(&deleter.site_id, deleter.counter);
            }
            document.integrate(node);
        }
        document.clock.merge(&state.vector_clock);
        Ok(document)
    }

    /// Serializes the document, tombstones included.
    pub fn state(&self) -> DocumentState {
        DocumentState {
            nodes: self.walk().into_iter().cloned().collect(),
            vector_clock: self.clock.clone(),
        }
    }

    /// Highest counter applied per site.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// First node of the document (live or tombstoned), if any.
    pub fn head(&self) -> Option<&NodeId> {
        self.roots.first()
    }

    pub fn get(&self, id: &NodeId) -> Option<&CrdtNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Inserts `value` after `after` (`None` = start of document).
    ///
    /// # Arguments
    ///
    /// * `value` - The character to insert
    /// * `after` - Anchor node; must already exist
    /// * `site_id`, `counter` - Identity of the insert, which becomes the node id
    ///
    /// # Returns
    ///
    /// * `Ok(NodeId)` - The id of the new node
    /// * `Err(DuplicateOperation)` - `(site_id, counter)` was already applied
    /// * `Err(CausalDependencyMissing)` - The anchor is not present
    pub fn insert(
        &mut self,
        value: char,
        after: Option<NodeId>,
        site_id: &str,
        counter: u64,
    ) -> Result<NodeId> {
        let id = NodeId::new(site_id, counter);
        if counter == 0 {
            return Err(CrdtError::InvalidOperation(format!(
                "insert {} has counter 0",
                id
            )));
        }
        if self.clock.covers(&id) || self.nodes.contains_key(&id) {
            return Err(CrdtError::DuplicateOperation(id));
        }
        if let Some(anchor) = &after {
            if !self.nodes.contains_key(anchor) {
                return Err(CrdtError::CausalDependencyMissing {
                    op: id,
                    missing: anchor.clone(),
                });
            }
        }

        self.integrate(CrdtNode::new(id.clone(), value, after));
        self.clock.observe(site_id, counter);
        Ok(id)
    }

    /// Tombstones `target` on behalf of the delete operation `op`.
    ///
    /// Returns `Ok(false)` when nothing visible changed: the target was
    /// already deleted, or it was already garbage collected (its insert is
    /// covered by the clock but the node is gone). The clock advances either
    /// way.
    pub fn delete(&mut self, target: &NodeId, op: NodeId) -> Result<bool> {
        if op.counter == 0 {
            return Err(CrdtError::InvalidOperation(format!(
                "delete {} has counter 0",
                op
            )));
        }
        if self.clock.covers(&op) {
            return Err(CrdtError::DuplicateOperation(op));
        }

        let changed = match self.nodes.get_mut(target) {
            Some(node) => node.mark_deleted(op.clone()),
            None if self.clock.covers(target) => false,
            None => {
                return Err(CrdtError::CausalDependencyMissing {
                    op,
                    missing: target.clone(),
                });
            }
        };
        self.clock.observe(&op.site_id, op.counter);
        Ok(changed)
    }

    /// Applies an operation received from any site.
    ///
    /// Operations already covered by the clock are reported as
    /// `Applied::Duplicate` rather than an error.
    pub fn apply_remote(&mut self, op: &Operation) -> Result<Applied> {
        if self.is_applied(op) {
            return Ok(Applied::Duplicate);
        }
        let outcome = match op {
            Operation::Insert { id, after, value } => self
                .insert(*value, after.clone(), &id.site_id, id.counter)
                .map(|_| ()),
            Operation::Delete { id, target } => self.delete(target, id.clone()).map(|_| ()),
        };
        match outcome {
            Ok(()) => Ok(Applied::Applied),
            Err(e) if e.is_duplicate() => Ok(Applied::Duplicate),
            Err(e) => Err(e),
        }
    }

    pub fn is_applied(&self, op: &Operation) -> bool {
        self.clock.covers(op.id())
    }

    /// Whether the node `op` references (anchor or target) can be resolved.
    pub fn dependencies_present(&self, op: &Operation) -> bool {
        match op {
            Operation::Insert { after: None, .. } => true,
            Operation::Insert {
                after: Some(anchor),
                ..
            } => self.nodes.contains_key(anchor),
            Operation::Delete { target, .. } => {
                self.nodes.contains_key(target) || self.clock.covers(target)
            }
        }
    }

    /// Visible characters in document order.
    pub fn linearize(&self) -> Vec<char> {
        self.walk()
            .into_iter()
            .filter(|node| node.is_visible())
            .map(|node| node.value)
            .collect()
    }

    pub fn text(&self) -> String {
        self.linearize().into_iter().collect()
    }

    /// Ids of visible nodes in document order.
    pub fn visible_ids(&self) -> Vec<NodeId> {
        self.walk()
            .into_iter()
            .filter(|node| node.is_visible())
            .map(|node| node.id.clone())
            .collect()
    }

    /// All nodes, tombstones included, in document order.
    pub fn all_nodes(&self) -> Vec<&CrdtNode> {
        self.walk()
    }

    /// Number of nodes including tombstones.
    pub fn total_node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn visible_node_count(&self) -> usize {
        self.nodes.values().filter(|node| node.is_visible()).count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.nodes.values().filter(|node| node.is_tombstone()).count()
    }

    pub fn children_of(&self, id: &NodeId) -> &[NodeId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Physically removes a node that has no children.
    ///
    /// Only the garbage collector calls this, and only for tombstones every
    /// site has observed.
    pub(crate) fn remove_leaf(&mut self, id: &NodeId) -> Option<CrdtNode> {
        if !self.children_of(id).is_empty() {
            return None;
        }
        let node = self.nodes.remove(id)?;
        self.children.remove(id);
        match &node.after_id {
            None => self.roots.retain(|sibling| sibling != id),
            Some(anchor) => {
                if let Some(siblings) = self.children.get_mut(anchor) {
                    siblings.retain(|sibling| sibling != id);
                    if siblings.is_empty() {
                        self.children.remove(anchor);
                    }
                }
            }
        }
        Some(node)
    }

    /// Places a node among its anchor's children, keeping them sorted by id
    /// descending.
    fn integrate(&mut self, node: CrdtNode) {
        let siblings = match &node.after_id {
            None => &mut self.roots,
            Some(anchor) => self.children.entry(anchor.clone()).or_default(),
        };
        let position = siblings.partition_point(|sibling| sibling > &node.id);
        siblings.insert(position, node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    /// Pre-order walk of the anchor tree.
    fn walk(&self) -> Vec<&CrdtNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&NodeId> = self.roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            out.push(node);
            stack.extend(self.children_of(id).iter().rev());
        }
        out
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for value in self.linearize() {
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}
