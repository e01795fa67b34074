//! Snapshot scheduling and document rehydration.
//!
//! Snapshots bound recovery cost: rebuilding a document loads the newest
//! snapshot and replays only the operations logged after it.

use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{OperationLog, Snapshot};
use crate::crdt::{CausalBuffer, Document};
use crate::error::Result;

/// Decides when a snapshot is due.
///
/// The manager only counts and builds the snapshot value; writing it is left
/// to the caller so that the write can happen off the operation path.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    document_id: String,
    interval: u64,
    operation_count: u64,
}

impl SnapshotManager {
    /// `operation_count` is the number of operations already logged.
    pub fn new(document_id: impl Into<String>, interval: u64, operation_count: u64) -> Self {
        SnapshotManager {
            document_id: document_id.into(),
            interval: interval.max(1),
            operation_count,
        }
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count
    }

    /// Records one applied operation and returns a snapshot if one is due.
    pub fn record_applied(&mut self, document: &Document) -> Option<Snapshot> {
        self.operation_count += 1;
        if self.operation_count % self.interval != 0 {
            return None;
        }
        debug!(
            "Snapshot due for {} at {} operations",
            self.document_id, self.operation_count
        );
        Some(self.snapshot(document))
    }

    pub fn snapshot(&self, document: &Document) -> Snapshot {
        let crdt_state = document.state();
        Snapshot {
            document_id: self.document_id.clone(),
            operation_count: self.operation_count,
            vector_clock: crdt_state.vector_clock.clone(),
            crdt_state,
            created_at: Utc::now(),
        }
    }
}

/// Rebuilds a document from its latest snapshot plus the operations logged
/// after it.
///
/// `target` bounds which snapshot may be used (`operation_count <= target`);
/// `None` takes the newest, or the stored `documents` state when its clock
/// dominates that snapshot's. Replay goes through a [`CausalBuffer`], so each
/// site's operations apply in counter order and cross-site anchors resolve
/// whatever order the log holds them in.
pub fn rebuild(
    log: &dyn OperationLog,
    document_id: &str,
    target: Option<u64>,
) -> Result<Document> {
    let stored = match target {
        Some(_) => None,
        None => log.load_document(document_id)?,
    };
    let snapshot = log.latest_snapshot(document_id, target)?.map(|snapshot| {
        debug!(
            "Latest snapshot of {} is at {} operations",
            document_id, snapshot.operation_count
        );
        let mut state = snapshot.crdt_state;
        state.vector_clock.merge(&snapshot.vector_clock);
        state
    });

    let start = match (stored, snapshot) {
        (Some(stored), Some(snapshot))
            if !stored.vector_clock.dominates(&snapshot.vector_clock) =>
        {
            Some(snapshot)
        }
        (Some(stored), _) => {
            debug!("Restoring {} from its stored state", document_id);
            Some(stored)
        }
        (None, snapshot) => snapshot,
    };
    let mut document = match start {
        Some(state) => Document::from_state(state)?,
        None => Document::new(),
    };

    let operations = log.operations_after(document_id, document.clock())?;
    let replayed = operations.len();
    let mut buffer = CausalBuffer::new(Duration::MAX);
    let now = Instant::now();
    for op in operations {
        buffer.push(op, now);
    }
    while let Some(op) = buffer.pop_ready(&document) {
        document.apply_remote(&op)?;
    }
    if !buffer.is_empty() {
        warn!(
            "{} logged operations for {} could not be replayed",
            buffer.len(),
            document_id
        );
    }

    info!(
        "Rebuilt {} ({} visible chars, {} operations replayed)",
        document_id,
        document.visible_node_count(),
        replayed
    );
    Ok(document)
}
