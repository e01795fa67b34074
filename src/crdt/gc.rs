//! Tombstone garbage collection.
//!
//! A tombstone may be physically removed once every site that could still
//! send an operation referencing it has observed the deletion. That set of
//! observations is summarized by the *frontier*: the pointwise minimum of the
//! relevant vector clocks.
//!
//! Only tombstones without children are removed (repeatedly, so whole deleted
//! runs go away). Removing a leaf tombstone cannot change where any future
//! sibling sorts relative to the remaining nodes, so a collected replica and
//! an uncollected one keep producing identical text.

use tracing::debug;

use crate::crdt::document::Document;
use crate::crdt::node::CrdtNode;
use crate::crdt::types::{NodeId, VectorClock};

/// Pointwise minimum of `upper` and every clock in `clocks`.
///
/// `upper` is normally the document's own clock, so an empty set of sessions
/// yields the document clock.
pub fn frontier<'a>(
    upper: &VectorClock,
    clocks: impl IntoIterator<Item = &'a VectorClock>,
) -> VectorClock {
    clocks
        .into_iter()
        .fold(upper.clone(), |acc, clock| acc.meet(clock))
}

fn is_collectable(node: &CrdtNode, frontier: &VectorClock) -> bool {
    node.deleted
        && node
            .deleted_by
            .as_ref()
            .is_some_and(|deleter| frontier.covers(deleter))
}

/// Tombstones that the frontier allows removing, whether or not they
/// currently have children.
pub fn collectable(document: &Document, frontier: &VectorClock) -> Vec<NodeId> {
    document
        .all_nodes()
        .into_iter()
        .filter(|node| is_collectable(node, frontier))
        .map(|node| node.id.clone())
        .collect()
}

/// Removes every tombstone the frontier allows, returning how many were
/// removed.
pub fn collect_garbage(document: &mut Document, frontier: &VectorClock) -> usize {
    let candidates = collectable(document, frontier);
    // Deepest first: reverse pre-order visits children before their anchors
    let mut removed = 0;
    for id in candidates.iter().rev() {
        if document.remove_leaf(id).is_some() {
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(
            "Collected {} of {} eligible tombstones",
            removed,
            candidates.len()
        );
    }
    removed
}
