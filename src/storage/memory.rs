//! In-memory operation log.
//!
//! Used when the server runs without a database path, and in tests. Data is
//! lost when dropped.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{AppendOutcome, OperationLog, Snapshot};
use crate::crdt::{DocumentState, NodeId, Operation, VectorClock};
use crate::error::Result;
use crate::session::ClientSession;

#[derive(Debug, Default)]
struct DocumentLog {
    operations: Vec<Operation>,
    ids: BTreeSet<NodeId>,
    snapshots: Vec<Snapshot>,
    state: Option<DocumentState>,
    sessions: BTreeMap<String, ClientSession>,
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    documents: RwLock<HashMap<String, DocumentLog>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationLog for MemoryLog {
    fn append(&self, document_id: &str, op: &Operation) -> Result<AppendOutcome> {
        let mut documents = self.documents.write();
        let log = documents.entry(document_id.to_string()).or_default();
        if !log.ids.insert(op.id().clone()) {
            return Ok(AppendOutcome::Duplicate);
        }
        log.operations.push(op.clone());
        Ok(AppendOutcome::Appended)
    }

    fn operations_after(&self, document_id: &str, clock: &VectorClock) -> Result<Vec<Operation>> {
        let documents = self.documents.read();
        Ok(documents
            .get(document_id)
            .map(|log| {
                log.operations
                    .iter()
                    .filter(|op| !clock.covers(op.id()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn operation_count(&self, document_id: &str) -> Result<u64> {
        let documents = self.documents.read();
        Ok(documents
            .get(document_id)
            .map(|log| log.operations.len() as u64)
            .unwrap_or(0))
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut documents = self.documents.write();
        documents
            .entry(snapshot.document_id.clone())
            .or_default()
            .snapshots
            .push(snapshot.clone());
        Ok(())
    }

    fn latest_snapshot(
        &self,
        document_id: &str,
        max_operation_count: Option<u64>,
    ) -> Result<Option<Snapshot>> {
        let documents = self.documents.read();
        Ok(documents.get(document_id).and_then(|log| {
            log.snapshots
                .iter()
                .filter(|s| max_operation_count.is_none_or(|max| s.operation_count <= max))
                .max_by_key(|s| s.operation_count)
                .cloned()
        }))
    }

    fn save_document(&self, document_id: &str, state: &DocumentState) -> Result<()> {
        let mut documents = self.documents.write();
        let stored = &mut documents.entry(document_id.to_string()).or_default().state;
        let stale = stored
            .as_ref()
            .is_some_and(|current| current.vector_clock.total() > state.vector_clock.total());
        if !stale {
            *stored = Some(state.clone());
        }
        Ok(())
    }

    fn load_document(&self, document_id: &str) -> Result<Option<DocumentState>> {
        let documents = self.documents.read();
        Ok(documents.get(document_id).and_then(|log| log.state.clone()))
    }

    fn list_documents(&self) -> Result<Vec<String>> {
        let documents = self.documents.read();
        let mut ids: Vec<String> = documents.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn save_session(&self, session: &ClientSession) -> Result<()> {
        let mut documents = self.documents.write();
        documents
            .entry(session.document_id.clone())
            .or_default()
            .sessions
            .insert(session.site_id.clone(), session.clone());
        Ok(())
    }

    fn load_sessions(&self, document_id: &str) -> Result<Vec<ClientSession>> {
        let documents = self.documents.read();
        Ok(documents
            .get(document_id)
            .map(|log| log.sessions.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_session(&self, document_id: &str, site_id: &str) -> Result<()> {
        let mut documents = self.documents.write();
        if let Some(log) = documents.get_mut(document_id) {
            log.sessions.remove(site_id);
        }
        Ok(())
    }
}
