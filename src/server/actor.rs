//! Per-document actor.
//!
//! Each open document is owned by exactly one [`DocumentActor`] task. All
//! mutations (joins, operations, progress reports, leaves, collection) are
//! commands processed one at a time from an mpsc channel, so the document
//! needs no locking. Connections talk to the actor through a cloneable
//! [`DocumentHandle`].

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::crdt::{
    Applied, CausalBuffer, Document, DocumentState, Operation, SiteId, VectorClock, gc,
};
use crate::error::{CrdtError, ErrorKind, Result};
use crate::protocol::Message;
use crate::session::{ClientSession, SessionRegistry};
use crate::storage::{self, AppendOutcome, OperationLog, Snapshot, SnapshotManager};

/// Channel carrying messages to one connected peer.
pub type Outbound = mpsc::UnboundedSender<Message>;

const MIN_TICK: Duration = Duration::from_millis(10);

pub enum Command {
    Join {
        site_id: SiteId,
        connection_id: String,
        vector_clock: VectorClock,
        outbound: Outbound,
        reply: oneshot::Sender<DocumentState>,
    },
    Operation {
        site_id: SiteId,
        op: Operation,
    },
    Progress {
        site_id: SiteId,
        vector_clock: VectorClock,
    },
    Leave {
        site_id: SiteId,
        connection_id: String,
    },
    CollectGarbage {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<DocumentStats>,
    },
}

/// Point-in-time view of a document, for health checks and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStats {
    pub document_id: String,
    pub text: String,
    pub vector_clock: VectorClock,
    pub visible_nodes: usize,
    pub tombstones: usize,
    pub buffered: usize,
    pub sessions: usize,
    pub connected: usize,
    pub operation_count: u64,
}

/// Cloneable sender side of a document actor.
#[derive(Clone)]
pub struct DocumentHandle {
    document_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl DocumentHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Registers `site_id` as a connected peer and returns the current state.
    pub async fn join(
        &self,
        site_id: impl Into<SiteId>,
        connection_id: impl Into<String>,
        vector_clock: VectorClock,
        outbound: Outbound,
    ) -> Result<DocumentState> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Join {
            site_id: site_id.into(),
            connection_id: connection_id.into(),
            vector_clock,
            outbound,
            reply,
        })?;
        response.await.map_err(|_| self.stopped())
    }

    pub fn submit(&self, site_id: impl Into<SiteId>, op: Operation) -> Result<()> {
        self.send(Command::Operation {
            site_id: site_id.into(),
            op,
        })
    }

    pub fn progress(&self, site_id: impl Into<SiteId>, vector_clock: VectorClock) -> Result<()> {
        self.send(Command::Progress {
            site_id: site_id.into(),
            vector_clock,
        })
    }

    pub fn leave(&self, site_id: impl Into<SiteId>, connection_id: impl Into<String>) {
        let result = self.send(Command::Leave {
            site_id: site_id.into(),
            connection_id: connection_id.into(),
        });
        if result.is_err() {
            debug!("Leave for stopped document {}", self.document_id);
        }
    }

    /// Runs a collection pass now instead of waiting for the next tick.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send(Command::CollectGarbage { reply })?;
        response.await.map_err(|_| self.stopped())
    }

    pub async fn stats(&self) -> Result<DocumentStats> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        response.await.map_err(|_| self.stopped())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> CrdtError {
        CrdtError::Transport(format!("document {} is not running", self.document_id))
    }
}

struct Peer {
    connection_id: String,
    outbound: Outbound,
}

pub struct DocumentActor {
    document_id: String,
    document: Document,
    buffer: CausalBuffer,
    sessions: SessionRegistry,
    peers: HashMap<SiteId, Peer>,
    snapshots: SnapshotManager,
    log: Arc<dyn OperationLog>,
    config: ServerConfig,
}

impl DocumentActor {
    /// Rebuilds the document and its sessions from the log.
    pub fn load(
        document_id: impl Into<String>,
        log: Arc<dyn OperationLog>,
        config: ServerConfig,
    ) -> Result<Self> {
        let document_id = document_id.into();
        let document = storage::rebuild(log.as_ref(), &document_id, None)?;
        let operation_count = log.operation_count(&document_id)?;
        let mut sessions = SessionRegistry::new(document_id.clone());
        sessions.restore(log.load_sessions(&document_id)?);

        info!(
            "Loaded {} ({} operations, {} known sessions)",
            document_id,
            operation_count,
            sessions.len()
        );
        Ok(DocumentActor {
            snapshots: SnapshotManager::new(
                document_id.clone(),
                config.snapshot_interval,
                operation_count,
            ),
            buffer: CausalBuffer::new(config.causal_timeout),
            peers: HashMap::new(),
            document_id,
            document,
            sessions,
            log,
            config,
        })
    }

    /// Spawns the actor task and returns its handle.
    ///
    /// Loading happens inside the task; if it fails the task ends and the
    /// handle reports itself closed.
    pub fn spawn(
        document_id: impl Into<String>,
        log: Arc<dyn OperationLog>,
        config: ServerConfig,
    ) -> DocumentHandle {
        let document_id: String = document_id.into();
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = DocumentHandle {
            document_id: Arc::from(document_id.as_str()),
            commands,
        };

        tokio::spawn(async move {
            let id = document_id.clone();
            let loaded =
                tokio::task::spawn_blocking(move || DocumentActor::load(id, log, config)).await;
            match loaded {
                Ok(Ok(actor)) => actor.run(receiver).await,
                Ok(Err(e)) => error!("Failed to load document {}: {}", document_id, e),
                Err(e) => error!("Loading document {} panicked: {}", document_id, e),
            }
        });
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let gc_period = self.config.gc_interval.max(MIN_TICK);
        let expiry_period = (self.config.causal_timeout / 2).max(MIN_TICK);
        let start = tokio::time::Instant::now();
        let mut gc_tick = interval_at(start + gc_period, gc_period);
        let mut expiry_tick = interval_at(start + expiry_period, expiry_period);
        gc_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        expiry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = gc_tick.tick() => {
                    self.collect_garbage();
                }
                _ = expiry_tick.tick() => self.expire_buffered(),
            }
        }

        let log = Arc::clone(&self.log);
        let document_id = self.document_id.clone();
        let state = self.document.state();
        let saved =
            tokio::task::spawn_blocking(move || log.save_document(&document_id, &state)).await;
        if let Ok(Err(e)) = saved {
            error!("Failed to save {} on shutdown: {}", self.document_id, e);
        }
        info!("Document actor {} stopped", self.document_id);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Join {
                site_id,
                connection_id,
                vector_clock,
                outbound,
                reply,
            } => self.join(site_id, connection_id, vector_clock, outbound, reply),
            Command::Operation { site_id, op } => self.receive(&site_id, op),
            Command::Progress {
                site_id,
                vector_clock,
            } => {
                if let Some(session) =
                    self.sessions
                        .record_progress(&site_id, &vector_clock, Utc::now())
                {
                    let session = session.clone();
                    self.persist_session(session);
                }
                // The reply tells the client which of its operations are applied
                self.send_to(&site_id, Message::progress(self.document.clock().clone()));
            }
            Command::Leave {
                site_id,
                connection_id,
            } => self.leave(&site_id, &connection_id),
            Command::CollectGarbage { reply } => {
                let removed = self.collect_garbage();
                let _ = reply.send(removed);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn join(
        &mut self,
        site_id: SiteId,
        connection_id: String,
        vector_clock: VectorClock,
        outbound: Outbound,
        reply: oneshot::Sender<DocumentState>,
    ) {
        // The client resends whatever it still has after SYNCED
        let discarded = self.buffer.discard_site(&site_id);
        if discarded > 0 {
            debug!(
                "Discarded {} buffered operations from rejoining {}",
                discarded, site_id
            );
        }

        let session = self
            .sessions
            .connect(&site_id, vector_clock, Utc::now())
            .clone();
        self.persist_session(session);
        self.peers.insert(
            site_id.clone(),
            Peer {
                connection_id,
                outbound,
            },
        );

        if reply.send(self.document.state()).is_err() {
            warn!("{} left {} before SYNCED", site_id, self.document_id);
        }
        info!(
            "{} joined {} ({} connected)",
            site_id,
            self.document_id,
            self.peers.len()
        );
    }

    fn leave(&mut self, site_id: &str, connection_id: &str) {
        // A reconnect may already have replaced this connection
        let current = self
            .peers
            .get(site_id)
            .is_some_and(|peer| peer.connection_id == connection_id);
        if !current {
            return;
        }
        self.peers.remove(site_id);
        if let Some(session) = self.sessions.disconnect(site_id, Utc::now()) {
            let session = session.clone();
            self.persist_session(session);
        }
    }

    fn receive(&mut self, site_id: &str, op: Operation) {
        if op.site_id() != site_id {
            let err = CrdtError::InvalidOperation(format!(
                "{} may not submit operation {} on behalf of another site",
                site_id,
                op.id()
            ));
            self.send_to(site_id, Message::from(&err));
            return;
        }
        if self.document.is_applied(&op) {
            debug!("Ignoring duplicate {} in {}", op.id(), self.document_id);
            return;
        }
        self.buffer.push(op, Instant::now());
        self.apply_ready();
    }

    /// Logs and applies every buffered operation that has become ready.
    fn apply_ready(&mut self) {
        while let Some(op) = self.buffer.pop_ready(&self.document) {
            match self.log.append(&self.document_id, &op) {
                Ok(AppendOutcome::Appended) => {}
                Ok(AppendOutcome::Duplicate) => {
                    debug!("{} is already logged; not applying", op.id());
                    continue;
                }
                Err(e) => {
                    error!("Failed to log {}: {}", op.id(), e);
                    self.send_to(op.site_id(), Message::from(&e));
                    continue;
                }
            }

            match self.document.apply_remote(&op) {
                Ok(Applied::Applied) => {
                    self.sessions.record_own_operation(op.id());
                    self.broadcast(&op);
                    if let Some(snapshot) = self.snapshots.record_applied(&self.document) {
                        self.persist_snapshot(snapshot);
                    }
                }
                Ok(Applied::Duplicate) => {}
                Err(e) => warn!("Logged operation {} failed to apply: {}", op.id(), e),
            }
        }
    }

    /// Sends `op` to every connected peer except its origin.
    fn broadcast(&mut self, op: &Operation) {
        let origin = op.site_id();
        let mut gone = Vec::new();
        for (site_id, peer) in &self.peers {
            if site_id == origin {
                continue;
            }
            if peer.outbound.send(Message::operation(op.clone())).is_err() {
                gone.push(site_id.clone());
            }
        }
        for site_id in gone {
            if let Some(peer) = self.peers.get(&site_id) {
                let connection_id = peer.connection_id.clone();
                self.leave(&site_id, &connection_id);
            }
        }
    }

    fn send_to(&self, site_id: &str, message: Message) {
        if let Some(peer) = self.peers.get(site_id) {
            if peer.outbound.send(message).is_err() {
                debug!("Peer {} is gone", site_id);
            }
        }
    }

    /// Drops operations whose dependencies never arrived and asks their
    /// origin to resync.
    fn expire_buffered(&mut self) {
        let expired = self.buffer.expire(Instant::now());
        if expired.is_empty() {
            return;
        }
        let mut by_site: BTreeMap<SiteId, Vec<Operation>> = BTreeMap::new();
        for op in expired {
            by_site.entry(op.site_id().to_string()).or_default().push(op);
        }
        for (site_id, ops) in by_site {
            warn!(
                "{} operations from {} expired in {} waiting for dependencies",
                ops.len(),
                site_id,
                self.document_id
            );
            let message = Message::error(
                ErrorKind::CausalDependencyMissing,
                format!(
                    "operation {} waited too long for its dependencies; rejoin to resync",
                    ops[0].id()
                ),
            );
            self.send_to(&site_id, message);
        }
    }

    /// Prunes expired sessions and removes tombstones every retained session
    /// has observed.
    fn collect_garbage(&mut self) -> usize {
        for session in self
            .sessions
            .prune_expired(Utc::now(), self.config.session_retention)
        {
            info!(
                "Session {} of {} expired after retention window",
                session.site_id, self.document_id
            );
            let log = Arc::clone(&self.log);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = log.delete_session(&session.document_id, &session.site_id) {
                    error!("Failed to delete session {}: {}", session.site_id, e);
                }
            });
        }

        let frontier = self.sessions.frontier(self.document.clock());
        let removed = gc::collect_garbage(&mut self.document, &frontier);
        if removed > 0 {
            info!(
                "Collected {} tombstones in {} ({} remain)",
                removed,
                self.document_id,
                self.document.tombstone_count()
            );
            let snapshot = self.snapshots.snapshot(&self.document);
            self.persist_snapshot(snapshot);
        }
        removed
    }

    fn stats(&self) -> DocumentStats {
        DocumentStats {
            document_id: self.document_id.clone(),
            text: self.document.text(),
            vector_clock: self.document.clock().clone(),
            visible_nodes: self.document.visible_node_count(),
            tombstones: self.document.tombstone_count(),
            buffered: self.buffer.len(),
            sessions: self.sessions.len(),
            connected: self.peers.len(),
            operation_count: self.snapshots.operation_count(),
        }
    }

    fn persist_snapshot(&self, snapshot: Snapshot) {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || {
            let result = log
                .save_snapshot(&snapshot)
                .and_then(|_| log.save_document(&snapshot.document_id, &snapshot.crdt_state));
            match result {
                Ok(()) => debug!(
                    "Saved snapshot of {} at {} operations",
                    snapshot.document_id, snapshot.operation_count
                ),
                Err(e) => error!("Failed to save snapshot of {}: {}", snapshot.document_id, e),
            }
        });
    }

    fn persist_session(&self, session: ClientSession) {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = log.save_session(&session) {
                error!("Failed to save session {}: {}", session.site_id, e);
            }
        });
    }
}
