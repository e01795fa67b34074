//! Causal delivery buffer.
//!
//! Remote operations are accepted in any order but applied only when they are
//! *ready*: the next counter expected from their site, with their anchor or
//! target present in the document. Everything else waits here, one min-heap
//! per site keyed by counter. Operations that wait longer than the configured
//! timeout are handed back so the caller can ask for a resync instead of
//! blocking forever.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::crdt::document::Document;
use crate::crdt::operation::Operation;
use crate::crdt::types::SiteId;

#[derive(Debug)]
struct Pending {
    op: Operation,
    received_at: Instant,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.op.counter() == other.op.counter()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so that BinaryHeap pops the lowest counter first
    fn cmp(&self, other: &Self) -> Ordering {
        other.op.counter().cmp(&self.op.counter())
    }
}

/// Per-site buffer of operations that are not yet causally ready.
#[derive(Debug)]
pub struct CausalBuffer {
    pending: BTreeMap<SiteId, BinaryHeap<Pending>>,
    timeout: Duration,
}

impl CausalBuffer {
    pub fn new(timeout: Duration) -> Self {
        CausalBuffer {
            pending: BTreeMap::new(),
            timeout,
        }
    }

    /// Buffers `op`, received at `now`.
    pub fn push(&mut self, op: Operation, now: Instant) {
        self.pending
            .entry(op.site_id().to_string())
            .or_default()
            .push(Pending {
                op,
                received_at: now,
            });
    }

    /// Whether `op` can be applied to `document` right now.
    pub fn is_ready(document: &Document, op: &Operation) -> bool {
        op.counter() == document.clock().next_counter(op.site_id())
            && document.dependencies_present(op)
    }

    /// Removes and returns the next operation that is ready to apply.
    ///
    /// Buffered operations that the document has meanwhile applied are
    /// dropped on the way. The caller must apply the returned operation
    /// before calling again, otherwise the same site cannot advance.
    pub fn pop_ready(&mut self, document: &Document) -> Option<Operation> {
        let mut ready = None;
        for (site, heap) in self.pending.iter_mut() {
            let applied = document.clock().get(site);
            while let Some(top) = heap.peek() {
                if top.op.counter() <= applied {
                    debug!("Dropping stale buffered operation {}", top.op.id());
                    heap.pop();
                    continue;
                }
                if Self::is_ready(document, &top.op) {
                    ready = heap.pop().map(|pending| pending.op);
                }
                break;
            }
            if ready.is_some() {
                break;
            }
        }
        self.pending.retain(|_, heap| !heap.is_empty());
        ready
    }

    /// Removes every operation buffered for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Operation> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        for heap in self.pending.values_mut() {
            let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(heap)
                .into_vec()
                .into_iter()
                .partition(|pending| now.duration_since(pending.received_at) >= timeout);
            expired.extend(stale.into_iter().map(|pending| pending.op));
            *heap = fresh.into_iter().collect();
        }
        self.pending.retain(|_, heap| !heap.is_empty());
        expired.sort_by(|a, b| a.id().cmp(b.id()));
        expired
    }

    /// Drops everything buffered from `site_id`, returning how many
    /// operations were discarded. Used when a site rejoins and will resend.
    pub fn discard_site(&mut self, site_id: &str) -> usize {
        self.pending.remove(site_id).map_or(0, |heap| heap.len())
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(BinaryHeap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
