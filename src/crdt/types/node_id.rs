//! Globally unique identifier for document nodes and operations.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::crdt::types::site::SiteId;

/// A unique identifier for each character/node in the document.
///
/// A `NodeId` is the `(site_id, counter)` pair of the operation that created
/// it, so it doubles as the identity of that operation. Delete operations
/// get their own `NodeId` from the same per-site counter.
///
/// # Ordering
///
/// Ids are ordered first by counter, then by site id. Siblings sharing an
/// anchor are laid out in *descending* id order, which is what makes
/// concurrent inserts at the same place converge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// The site that created this node
    pub site_id: SiteId,
    /// Per-site monotonic counter, starting at 1
    pub counter: u64,
}

impl NodeId {
    /// Creates a new NodeId from a site id and counter
    pub fn new(site_id: impl Into<SiteId>, counter: u64) -> Self {
        NodeId {
            site_id: site_id.into(),
            counter,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.site_id.cmp(&other.site_id),
            other => other,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site_id, self.counter)
    }
}
