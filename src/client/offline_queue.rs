//! Durable FIFO of local operations waiting to be sent.
//!
//! When a path is configured the whole queue is rewritten as JSON after
//! every change (write to a sibling temp file, then rename), so a crash
//! leaves either the old or the new contents on disk. The file also records
//! the site id that produced the entries: a restarted client must keep
//! editing as that site, or its queued operations could not be replayed.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::crdt::{Operation, SiteId};
use crate::error::{CrdtError, Result};

#[derive(Debug, Default)]
pub struct OfflineQueue {
    site_id: Option<SiteId>,
    entries: VecDeque<Operation>,
    path: Option<PathBuf>,
}

/// On-disk form of the queue.
#[derive(Serialize)]
struct QueueFileRef<'a> {
    site_id: &'a str,
    entries: &'a VecDeque<Operation>,
}

#[derive(Deserialize)]
struct QueueFile {
    site_id: SiteId,
    entries: VecDeque<Operation>,
}

impl OfflineQueue {
    /// A queue that accepts operations from any site and is lost on exit.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the queue stored at `path`.
    ///
    /// A queue file that already exists keeps the site id it was written
    /// with; `site_id` only names a queue created here.
    pub fn open(path: impl AsRef<Path>, site_id: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stored = if path.exists() {
            let data = fs::read(&path)?;
            if data.is_empty() {
                None
            } else {
                Some(serde_json::from_slice::<QueueFile>(&data)?)
            }
        } else {
            None
        };

        let queue = match stored {
            Some(file) => {
                if file.site_id != site_id {
                    info!(
                        "Queue {} belongs to site {}; resuming it",
                        path.display(),
                        file.site_id
                    );
                }
                if !file.entries.is_empty() {
                    info!(
                        "Loaded {} queued operations from {}",
                        file.entries.len(),
                        path.display()
                    );
                }
                OfflineQueue {
                    site_id: Some(file.site_id),
                    entries: file.entries,
                    path: Some(path),
                }
            }
            None => {
                let queue = OfflineQueue {
                    site_id: Some(site_id.to_string()),
                    entries: VecDeque::new(),
                    path: Some(path),
                };
                queue.persist()?;
                queue
            }
        };
        Ok(queue)
    }

    /// Site whose operations this queue holds, if it is bound to one.
    pub fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }

    pub fn push(&mut self, op: Operation) -> Result<()> {
        if let Some(site_id) = &self.site_id {
            if op.site_id() != site_id {
                return Err(CrdtError::InvalidOperation(format!(
                    "operation {} does not belong to queue of site {}",
                    op.id(),
                    site_id
                )));
            }
        }
        self.entries.push_back(op);
        self.persist()
    }

    pub fn front(&self) -> Option<&Operation> {
        self.entries.front()
    }

    /// Removes the oldest entry. Call only once that entry has been sent.
    pub fn pop_front(&mut self) -> Result<Option<Operation>> {
        let op = self.entries.pop_front();
        if op.is_some() {
            self.persist()?;
        }
        Ok(op)
    }

    /// Replaces the contents, keeping the given order.
    pub fn replace(&mut self, ops: impl IntoIterator<Item = Operation>) -> Result<()> {
        self.entries = ops.into_iter().collect();
        self.persist()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let (Some(path), Some(site_id)) = (&self.path, &self.site_id) else {
            return Ok(());
        };
        let data = serde_json::to_vec(&QueueFileRef {
            site_id,
            entries: &self.entries,
        })?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        debug!("Persisted {} queued operations", self.entries.len());
        Ok(())
    }
}
