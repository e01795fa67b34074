//! Registry of open documents.

use crossbeam_skiplist::SkipMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::actor::{DocumentActor, DocumentHandle};
use crate::config::ServerConfig;
use crate::storage::OperationLog;

/// Maps document ids to their running actors.
///
/// Lookups and inserts are lock-free. An actor is spawned the first time a
/// document is asked for; if two connections race, the losing actor's handle
/// is dropped and that actor exits as soon as it finishes loading.
pub struct DocumentRegistry {
    documents: SkipMap<String, DocumentHandle>,
    log: Arc<dyn OperationLog>,
    config: ServerConfig,
}

impl DocumentRegistry {
    pub fn new(log: Arc<dyn OperationLog>, config: ServerConfig) -> Self {
        DocumentRegistry {
            documents: SkipMap::new(),
            log,
            config,
        }
    }

    /// Handle of the actor owning `document_id`, starting it if needed.
    pub fn handle(&self, document_id: &str) -> DocumentHandle {
        loop {
            let entry = self.documents.get_or_insert_with(document_id.to_string(), || {
                info!("Opening document {}", document_id);
                DocumentActor::spawn(document_id, Arc::clone(&self.log), self.config.clone())
            });
            let handle = entry.value().clone();
            if !handle.is_closed() {
                return handle;
            }
            // The actor failed to load or stopped; start a fresh one
            debug!("Replacing stopped actor for {}", document_id);
            entry.remove();
        }
    }

    /// Number of open documents
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.documents
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn log(&self) -> &Arc<dyn OperationLog> {
        &self.log
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
