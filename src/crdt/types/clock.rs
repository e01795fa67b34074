//! Vector clock tracking per-site causal progress.
//!
//! Each entry is the highest operation counter applied from a site. Because
//! operations from one site are applied strictly in counter order, an entry
//! `site -> n` means every operation `(site, 1..=n)` has been applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crdt::types::node_id::NodeId;
use crate::crdt::types::site::SiteId;

/// Map of site id to highest observed counter.
///
/// Missing sites read as zero. A `BTreeMap` keeps the serialized form stable,
/// which matters for snapshots compared across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<SiteId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter observed from `site_id` (0 if none)
    pub fn get(&self, site_id: &str) -> u64 {
        self.entries.get(site_id).copied().unwrap_or(0)
    }

    /// The counter the next operation from `site_id` must carry
    pub fn next_counter(&self, site_id: &str) -> u64 {
        self.get(site_id) + 1
    }

    /// Records `counter` for `site_id`, never moving backwards
    pub fn observe(&mut self, site_id: &str, counter: u64) {
        if counter == 0 {
            return;
        }
        match self.entries.get_mut(site_id) {
            Some(current) => *current = (*current).max(counter),
            None => {
                self.entries.insert(site_id.to_string(), counter);
            }
        }
    }

    /// Whether the operation identified by `id` is covered by this clock
    pub fn covers(&self, id: &NodeId) -> bool {
        id.counter <= self.get(&id.site_id)
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VectorClock) {
        for (site, &counter) in &other.entries {
            self.observe(site, counter);
        }
    }

    /// Pointwise minimum; a site missing from either side becomes zero.
    pub fn meet(&self, other: &VectorClock) -> VectorClock {
        let entries = self
            .entries
            .iter()
            .filter_map(|(site, &counter)| {
                let min = counter.min(other.get(site));
                (min > 0).then(|| (site.clone(), min))
            })
            .collect();
        VectorClock { entries }
    }

    /// Whether every entry of `other` is covered by this clock
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(site, &counter)| self.get(site) >= counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, u64)> {
        self.entries.iter().map(|(site, &counter)| (site, counter))
    }

    /// Sum of all entries, i.e. the number of operations applied
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(SiteId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (SiteId, u64)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (site, counter) in iter {
            clock.observe(&site, counter);
        }
        clock
    }
}
