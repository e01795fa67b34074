//! Editor-facing replica of a document.
//!
//! A [`Replica`] turns editor offsets into operations, applies remote
//! operations in causal order, and reports their visible effect back to the
//! editor as [`RemoteChange`]s expressed in offsets.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::crdt::{
    Applied, CausalBuffer, Document, DocumentState, NodeId, Operation, PositionMap, SiteId,
    VectorClock,
};
use crate::error::{CrdtError, Result};

/// Visible effect of remote activity, in editor offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    Insert { offset: usize, value: char },
    Delete { offset: usize },
    /// The whole text was replaced after a resync
    Reset { text: String },
    /// A local insert typed at `from` was placed at `to`, behind a sibling
    /// that sorts before it
    Relocated { from: usize, to: usize, value: char },
}

type ChangeCallback = Box<dyn FnMut(&RemoteChange) + Send>;

pub struct Replica {
    site_id: SiteId,
    document: Document,
    positions: PositionMap,
    buffer: CausalBuffer,
    /// Own operations the server has not yet confirmed, by `SYNCED` state or
    /// by the clock it returns for a `PROGRESS`
    unconfirmed: Vec<Operation>,
    listeners: Vec<ChangeCallback>,
}

impl Replica {
    pub fn new(site_id: impl Into<SiteId>, causal_timeout: Duration) -> Self {
        Replica {
            site_id: site_id.into(),
            document: Document::new(),
            positions: PositionMap::new(),
            buffer: CausalBuffer::new(causal_timeout),
            unconfirmed: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn clock(&self) -> &VectorClock {
        self.document.clock()
    }

    /// Number of visible characters
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Remote operations waiting for their dependencies.
    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Visible offset of the character `id`, if it is visible.
    pub fn offset_of(&self, id: &NodeId) -> Option<usize> {
        self.positions.get_index_of_id(id)
    }

    /// Inserts `value` after the character before visible `offset`,
    /// returning the operation to send.
    ///
    /// Siblings of that anchor with a higher id stay in front of the new
    /// character, so it can end up further right than `offset`. When it
    /// does, listeners receive [`RemoteChange::Relocated`] with the offset it
    /// really occupies.
    pub fn apply_local_insert(&mut self, offset: usize, value: char) -> Result<Operation> {
        if offset > self.positions.len() {
            return Err(CrdtError::InvalidOperation(format!(
                "insert offset {} is past the end ({})",
                offset,
                self.positions.len()
            )));
        }
        let after = self.positions.get_id_before_index(offset).cloned();
        let counter = self.document.clock().next_counter(&self.site_id);
        let id = self
            .document
            .insert(value, after.clone(), &self.site_id, counter)?;
        self.positions.rebuild(&self.document);

        match self.positions.get_index_of_id(&id) {
            Some(to) if to != offset => {
                debug!("Local insert {} moved from {} to {}", id, offset, to);
                self.notify(&[RemoteChange::Relocated {
                    from: offset,
                    to,
                    value,
                }]);
            }
            _ => {}
        }

        let op = Operation::insert(id, after, value);
        self.unconfirmed.push(op.clone());
        Ok(op)
    }

    /// Deletes the character at visible `offset`, returning the operation to
    /// send.
    pub fn apply_local_delete(&mut self, offset: usize) -> Result<Operation> {
        let target = self
            .positions
            .get_id_at_index(offset)
            .cloned()
            .ok_or_else(|| {
                CrdtError::InvalidOperation(format!(
                    "delete offset {} is out of range ({})",
                    offset,
                    self.positions.len()
                ))
            })?;
        let id = NodeId::new(
            self.site_id.clone(),
            self.document.clock().next_counter(&self.site_id),
        );
        self.document.delete(&target, id.clone())?;
        self.positions.rebuild(&self.document);

        let op = Operation::delete(id, target);
        self.unconfirmed.push(op.clone());
        Ok(op)
    }

    /// Forgets own operations covered by `server_clock`; returns how many.
    pub fn confirm(&mut self, server_clock: &VectorClock) -> usize {
        let before = self.unconfirmed.len();
        self.unconfirmed.retain(|op| !server_clock.covers(op.id()));
        before - self.unconfirmed.len()
    }

    /// Registers a callback invoked for every visible change the editor did
    /// not make itself.
    pub fn on_remote_change<F>(&mut self, callback: F)
    where
        F: FnMut(&RemoteChange) + Send + 'static,
    {
        self.listeners.push(Box::new(callback));
    }

    /// Accepts a remote operation.
    ///
    /// The operation is buffered until its causal dependencies are present;
    /// every operation this unblocks is applied too. Returns the visible
    /// changes in the order they happened.
    pub fn receive(&mut self, op: Operation, now: Instant) -> Result<Vec<RemoteChange>> {
        if self.document.is_applied(&op) {
            debug!("Ignoring duplicate {}", op.id());
            return Ok(Vec::new());
        }
        self.buffer.push(op, now);

        let mut changes = Vec::new();
        while let Some(ready) = self.buffer.pop_ready(&self.document) {
            if let Some(change) = self.integrate(&ready)? {
                changes.push(change);
            }
        }
        self.notify(&changes);
        Ok(changes)
    }

    /// Drops remote operations that waited longer than the causal timeout.
    ///
    /// A non-empty result means this replica is missing history and should
    /// rejoin for a full state.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<Operation> {
        let expired = self.buffer.expire(now);
        if !expired.is_empty() {
            warn!(
                "{} remote operations expired waiting for dependencies",
                expired.len()
            );
        }
        expired
    }

    /// Replaces the local document with `state` and re-applies the local
    /// operations the server does not have yet.
    ///
    /// `pending_local` is the offline queue; own operations already sent but
    /// not covered by `state` are included as well. Returns the operations
    /// that must be (re)sent, in counter order. Operations that can no longer
    /// be placed, because their anchor was collected on the server, are
    /// dropped along with anything anchored on them.
    ///
    /// Fails without touching the replica if `pending_local` holds another
    /// site's operations.
    pub fn resync(
        &mut self,
        state: DocumentState,
        pending_local: impl IntoIterator<Item = Operation>,
    ) -> Result<Vec<Operation>> {
        let pending: Vec<Operation> = pending_local.into_iter().collect();
        if let Some(foreign) = pending.iter().find(|op| op.site_id() != self.site_id) {
            return Err(CrdtError::InvalidOperation(format!(
                "queued operation {} was not made by site {}",
                foreign.id(),
                self.site_id
            )));
        }
        let mut document = Document::from_state(state)?;

        let mut candidates: Vec<Operation> = self.unconfirmed.drain(..).collect();
        candidates.extend(pending);
        candidates.retain(|op| !document.is_applied(op));
        candidates.sort_by_key(Operation::counter);
        candidates.dedup_by(|a, b| a.id() == b.id());

        // Own operations unknown to the server are renumbered from the
        // server's clock so the site's counters stay contiguous even when
        // some of them had to be dropped. `None` marks a dropped operation.
        let mut renamed: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        let resolve =
            |renamed: &HashMap<NodeId, Option<NodeId>>, id: NodeId| match renamed.get(&id) {
                Some(mapped) => mapped.clone(),
                None => Some(id),
            };
        let mut resend = Vec::with_capacity(candidates.len());
        for op in candidates {
            let original = op.id().clone();
            let id = NodeId::new(
                self.site_id.clone(),
                document.clock().next_counter(&self.site_id),
            );
            let rewritten = match op {
                Operation::Insert {
                    after: None, value, ..
                } => Some(Operation::insert(id, None, value)),
                Operation::Insert {
                    after: Some(anchor),
                    value,
                    ..
                } => resolve(&renamed, anchor)
                    .map(|anchor| Operation::insert(id, Some(anchor), value)),
                Operation::Delete { target, .. } => {
                    resolve(&renamed, target).map(|target| Operation::delete(id, target))
                }
            };
            let applied = match rewritten {
                Some(op) => match document.apply_remote(&op) {
                    Ok(Applied::Applied) => Some(op),
                    Ok(Applied::Duplicate) => None,
                    Err(e) => {
                        warn!("Dropping local operation {}: {}", original, e);
                        None
                    }
                },
                None => {
                    warn!(
                        "Dropping local operation {}: its dependency was dropped",
                        original
                    );
                    None
                }
            };
            renamed.insert(original, applied.as_ref().map(|op| op.id().clone()));
            resend.extend(applied);
        }

        self.document = document;
        self.buffer.clear();
        self.positions.rebuild(&self.document);
        self.unconfirmed = resend.clone();

        debug!(
            "Resynced {} ({} local operations to resend)",
            self.site_id,
            resend.len()
        );
        self.notify(&[RemoteChange::Reset { text: self.text() }]);
        Ok(resend)
    }

    fn integrate(&mut self, op: &Operation) -> Result<Option<RemoteChange>> {
        match op {
            Operation::Insert { id, value, .. } => {
                if self.document.apply_remote(op)? == Applied::Duplicate {
                    return Ok(None);
                }
                self.positions.rebuild(&self.document);
                Ok(self
                    .positions
                    .get_index_of_id(id)
                    .map(|offset| RemoteChange::Insert {
                        offset,
                        value: *value,
                    }))
            }
            Operation::Delete { target, .. } => {
                // Offset must be read before the node leaves the map
                let offset = self.positions.get_index_of_id(target);
                if self.document.apply_remote(op)? == Applied::Duplicate {
                    return Ok(None);
                }
                match offset {
                    Some(offset) => {
                        self.positions.rebuild(&self.document);
                        Ok(Some(RemoteChange::Delete { offset }))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn notify(&mut self, changes: &[RemoteChange]) {
        for change in changes {
            for listener in &mut self.listeners {
                listener(change);
            }
        }
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("site_id", &self.site_id)
            .field("text", &self.document.text())
            .field("clock", self.document.clock())
            .field("pending", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn type_text(replica: &mut Replica, offset: usize, text: &str) -> Vec<Operation> {
        text.chars()
            .enumerate()
            .map(|(i, ch)| replica.apply_local_insert(offset + i, ch).unwrap())
            .collect()
    }

    #[test]
    fn test_local_edits_at_offsets() {
        let mut replica = Replica::new("a", TIMEOUT);
        type_text(&mut replica, 0, "hllo");
        replica.apply_local_insert(1, 'e').unwrap();
        assert_eq!(replica.text(), "hello");
        replica.apply_local_delete(0).unwrap();
        assert_eq!(replica.text(), "ello");
        assert_eq!(replica.clock().get("a"), 6);
    }

    #[test]
    fn test_out_of_range_offsets() {
        let mut replica = Replica::new("a", TIMEOUT);
        type_text(&mut replica, 0, "ab");
        assert!(matches!(
            replica.apply_local_insert(3, 'x'),
            Err(CrdtError::InvalidOperation(_))
        ));
        assert!(matches!(
            replica.apply_local_delete(2),
            Err(CrdtError::InvalidOperation(_))
        ));
        assert_eq!(replica.text(), "ab");
        assert_eq!(replica.clock().get("a"), 2);
    }

    #[test]
    fn test_remote_changes_are_reported_in_offsets() {
        let mut a = Replica::new("a", TIMEOUT);
        let mut b = Replica::new("b", TIMEOUT);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        b.on_remote_change(move |change| sink.lock().unwrap().push(change.clone()));

        let ops = type_text(&mut a, 0, "hi");
        let delete = a.apply_local_delete(0).unwrap();
        let now = Instant::now();
        for op in ops {
            b.receive(op, now).unwrap();
        }
        b.receive(delete, now).unwrap();

        assert_eq!(b.text(), "i");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                RemoteChange::Insert {
                    offset: 0,
                    value: 'h'
                },
                RemoteChange::Insert {
                    offset: 1,
                    value: 'i'
                },
                RemoteChange::Delete { offset: 0 },
            ]
        );
    }

    #[test]
    fn test_out_of_order_remote_ops_wait_for_dependencies() {
        let mut a = Replica::new("a", TIMEOUT);
        let mut b = Replica::new("b", TIMEOUT);
        let ops = type_text(&mut a, 0, "xyz");
        let now = Instant::now();

        assert!(b.receive(ops[2].clone(), now).unwrap().is_empty());
        assert!(b.receive(ops[1].clone(), now).unwrap().is_empty());
        assert_eq!(b.pending_count(), 2);
        let changes = b.receive(ops[0].clone(), now).unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(b.text(), "xyz");
        assert_eq!(b.pending_count(), 0);

        // Replays are ignored
        assert!(b.receive(ops[1].clone(), now).unwrap().is_empty());
    }

    #[test]
    fn test_expire_pending_reports_stuck_ops() {
        let mut b = Replica::new("b", Duration::from_millis(10));
        let orphan = Operation::insert(NodeId::new("a", 2), Some(NodeId::new("a", 1)), 'y');
        let start = Instant::now();
        b.receive(orphan, start).unwrap();
        assert!(b.expire_pending(start).is_empty());
        let expired = b.expire_pending(start + Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_resync_reapplies_unsent_local_ops() {
        let mut server = Replica::new("s", TIMEOUT);
        type_text(&mut server, 0, "ab");
        let state = server.document().state();

        let mut client = Replica::new("c", TIMEOUT);
        let queued = type_text(&mut client, 0, "xy");
        let resend = client.resync(state, queued).unwrap();

        assert_eq!(resend.len(), 2);
        assert_eq!(client.text(), "abxy");
        assert_eq!(client.clock().get("s"), 2);
        assert_eq!(client.clock().get("c"), 2);
        // Next local op continues the site's counter
        let op = client.apply_local_insert(4, '!').unwrap();
        assert_eq!(op.counter(), 3);
    }

    #[test]
    fn test_resync_skips_ops_the_server_already_has() {
        let mut client = Replica::new("c", TIMEOUT);
        let sent = type_text(&mut client, 0, "ab");
        let server_state = client.document().state();
        let queued = type_text(&mut client, 2, "c");

        let resend = client.resync(server_state, queued).unwrap();
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].counter(), 3);
        assert_eq!(client.text(), "abc");
        assert!(sent.iter().all(|op| client.document().is_applied(op)));
    }

    #[test]
    fn test_resync_drops_ops_with_collected_anchor() {
        let mut client = Replica::new("c", TIMEOUT);
        let orphan = Operation::insert(NodeId::new("c", 1), Some(NodeId::new("gone", 1)), 'q');
        let resend = client.resync(DocumentState::default(), vec![orphan]).unwrap();
        assert!(resend.is_empty());
        assert_eq!(client.text(), "");
    }

    #[test]
    fn test_resync_renumbers_after_dropped_op() {
        let mut client = Replica::new("c", TIMEOUT);
        let queued = vec![
            Operation::insert(NodeId::new("c", 1), Some(NodeId::new("gone", 1)), 'q'),
            Operation::insert(NodeId::new("c", 2), None, 'k'),
            Operation::insert(NodeId::new("c", 3), Some(NodeId::new("c", 2)), 'l'),
            Operation::delete(NodeId::new("c", 4), NodeId::new("c", 1)),
        ];
        let resend = client.resync(DocumentState::default(), queued).unwrap();

        assert_eq!(client.text(), "kl");
        assert_eq!(
            resend,
            vec![
                Operation::insert(NodeId::new("c", 1), None, 'k'),
                Operation::insert(NodeId::new("c", 2), Some(NodeId::new("c", 1)), 'l'),
            ]
        );
        assert_eq!(client.clock().get("c"), 2);
    }

    #[test]
    fn test_resync_refuses_another_sites_queue() {
        let mut old = Replica::new("site-old", TIMEOUT);
        let queued = type_text(&mut old, 0, "draft");

        let mut fresh = Replica::new("site-new", TIMEOUT);
        type_text(&mut fresh, 0, "x");
        let result = fresh.resync(DocumentState::default(), queued);
        assert!(matches!(result, Err(CrdtError::InvalidOperation(_))));
        // Nothing was dropped
        assert_eq!(fresh.text(), "x");
        assert_eq!(fresh.unconfirmed_count(), 1);
    }

    #[test]
    fn test_insert_behind_higher_sibling_reports_real_offset() {
        let mut a = Replica::new("a", TIMEOUT);
        let mut b = Replica::new("b", TIMEOUT);
        let now = Instant::now();
        for op in type_text(&mut b, 0, "hello") {
            a.receive(op, now).unwrap();
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        a.on_remote_change(move |change| sink.lock().unwrap().push(change.clone()));

        // 'e' (b:2) outranks a:1 under the shared anchor 'h'
        let op = a.apply_local_insert(1, 'X').unwrap();
        assert_eq!(a.text(), "helloX");
        assert_eq!(a.offset_of(op.id()), Some(5));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![RemoteChange::Relocated {
                from: 1,
                to: 5,
                value: 'X'
            }]
        );

        // Typing where the character really is raises nothing
        a.apply_local_insert(6, 'Y').unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_confirm_prunes_acknowledged_ops() {
        let mut replica = Replica::new("a", TIMEOUT);
        for i in 0..1000 {
            replica.apply_local_insert(i, 'x').unwrap();
        }
        for _ in 0..1000 {
            replica.apply_local_delete(0).unwrap();
        }
        assert_eq!(replica.unconfirmed_count(), 2000);

        let mut server = VectorClock::new();
        server.observe("a", 1500);
        assert_eq!(replica.confirm(&server), 1500);
        assert_eq!(replica.unconfirmed_count(), 500);

        let clock = replica.clock().clone();
        assert_eq!(replica.confirm(&clock), 500);
        assert_eq!(replica.unconfirmed_count(), 0);

        // Confirmed operations are not resent after a resync
        let state = replica.document().state();
        assert!(replica.resync(state, Vec::new()).unwrap().is_empty());
    }
}
