//! Sync client: keeps a [`Replica`] attached to the server over WebSocket.
//!
//! The [`SyncClient`] handle is what the editor holds. Local edits are applied
//! to the replica immediately and appended to the offline queue; a background
//! task owns the socket, drains the queue whenever the connection is synced
//! and feeds remote operations into the replica.
//!
//! # Connection lifecycle
//!
//! `connect -> JOIN -> SYNCED (resync, drain queue, PROGRESS) -> relay`.
//! The server answers each `PROGRESS` with its own clock, which confirms the
//! local operations it has applied.
//! On any transport failure the task reconnects with
//! [`Backoff`](super::Backoff) and gives up
//! with [`ConnectionState::Failed`] after the last attempt. A
//! `causal_dependency_missing` error from the server, or a local causal
//! timeout, triggers a fresh `JOIN` on the same connection.

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use super::{OfflineQueue, RemoteChange, Replica};
use crate::config::ClientConfig;
use crate::crdt::{DocumentState, Operation, VectorClock};
use crate::error::{CrdtError, ErrorKind, Result};
use crate::protocol::{self, Message};

/// How often the applied clock is reported to the server (when it changed).
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Status of the sync connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection attempts are exhausted
    Failed { message: String },
}

enum Command {
    /// New entries are waiting in the offline queue
    Flush,
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    Lost { synced: bool, reason: String },
}

/// Editor-side handle of a synced document.
pub struct SyncClient {
    replica: Arc<Mutex<Replica>>,
    queue: Arc<Mutex<OfflineQueue>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Opens the offline queue and starts the background connection task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// A durable queue written by an earlier run decides the site id, so
    /// operations queued before a restart keep their identity.
    pub fn start(mut config: ClientConfig) -> Result<Self> {
        let queue = match &config.offline_queue_path {
            Some(path) => OfflineQueue::open(path, &config.site_id)?,
            None => OfflineQueue::in_memory(),
        };
        if let Some(site_id) = queue.site_id() {
            config.site_id = site_id.to_string();
        }
        let replica = Arc::new(Mutex::new(Replica::new(
            config.site_id.clone(),
            config.causal_timeout,
        )));
        let queue = Arc::new(Mutex::new(queue));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = Worker {
            config,
            replica: Arc::clone(&replica),
            queue: Arc::clone(&queue),
            commands: commands_rx,
            state: state_tx,
        };
        let task = tokio::spawn(worker.run());

        Ok(SyncClient {
            replica,
            queue,
            commands: commands_tx,
            state: state_rx,
            task: Some(task),
        })
    }

    /// Inserts `value` at visible `offset` and schedules it for sending.
    ///
    /// If the character is placed elsewhere, listeners receive
    /// [`RemoteChange::Relocated`] before this returns.
    pub fn insert(&self, offset: usize, value: char) -> Result<Operation> {
        let op = {
            let mut replica = self.replica.lock();
            let op = replica.apply_local_insert(offset, value)?;
            self.queue.lock().push(op.clone())?;
            op
        };
        self.notify_worker();
        Ok(op)
    }

    /// Deletes the character at visible `offset` and schedules it for sending.
    pub fn delete(&self, offset: usize) -> Result<Operation> {
        let op = {
            let mut replica = self.replica.lock();
            let op = replica.apply_local_delete(offset)?;
            self.queue.lock().push(op.clone())?;
            op
        };
        self.notify_worker();
        Ok(op)
    }

    /// Registers a callback for remote changes.
    ///
    /// The callback runs on the connection task while the replica is locked;
    /// it must not call back into this client.
    pub fn on_remote_change<F>(&self, callback: F)
    where
        F: FnMut(&RemoteChange) + Send + 'static,
    {
        self.replica.lock().on_remote_change(callback);
    }

    pub fn text(&self) -> String {
        self.replica.lock().text()
    }

    pub fn clock(&self) -> VectorClock {
        self.replica.lock().clock().clone()
    }

    pub fn site_id(&self) -> String {
        self.replica.lock().site_id().to_string()
    }

    /// Local operations not yet sent.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Local operations sent but not yet acknowledged by the server.
    pub fn unconfirmed(&self) -> usize {
        self.replica.lock().unconfirmed_count()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Closes the connection and waits for the background task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Sync task ended abnormally: {}", e);
            }
        }
    }

    fn notify_worker(&self) {
        // A stopped worker leaves the operation in the durable queue
        if self.commands.send(Command::Flush).is_err() {
            debug!("Sync task is not running; operation stays queued");
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Background half of the client; owns the socket.
struct Worker {
    config: ClientConfig,
    replica: Arc<Mutex<Replica>>,
    queue: Arc<Mutex<OfflineQueue>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
}

impl Worker {
    async fn run(mut self) {
        let url = self.config.server_url.clone();
        let mut attempt: u32 = 0;

        loop {
            if attempt == 0 {
                self.set_state(ConnectionState::Connecting);
            }
            info!("Connecting to {}", url);

            let end = match connect_async(url.as_str()).await {
                Ok((stream, _)) => self.run_session(stream).await,
                Err(e) => SessionEnd::Lost {
                    synced: false,
                    reason: e.to_string(),
                },
            };

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost { synced, reason } => {
                    warn!("Connection to {} lost: {}", url, reason);
                    if synced {
                        attempt = 0;
                    }
                }
            }

            attempt += 1;
            let Some(delay) = self.config.backoff.delay(attempt) else {
                error!("Max reconnect attempts reached for {}", url);
                self.set_state(ConnectionState::Failed {
                    message: format!("gave up after {} reconnect attempts", attempt - 1),
                });
                return;
            };
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            if self.sleep_unless_shutdown(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Sync task for {} stopped", self.config.document_id);
    }

    /// Waits out a backoff delay. Local edits made meanwhile are already in
    /// the durable queue. Returns `true` if shutdown was requested.
    async fn sleep_unless_shutdown(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Flush) => {}
                    Some(Command::Shutdown) | None => return true,
                },
            }
        }
    }

    async fn run_session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let mut synced = false;
        let mut ever_synced = false;
        let mut reported: Option<VectorClock> = None;
        let lost = |synced: bool, reason: String| SessionEnd::Lost { synced, reason };

        if let Err(e) = self.send_join(&mut write).await {
            return lost(false, e.to_string());
        }

        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        let mut expiry =
            tokio::time::interval((self.config.causal_timeout / 2).max(Duration::from_millis(10)));

        loop {
            tokio::select! {
                frame = read.next() => {
                    let bytes = match frame {
                        Some(Ok(WsMessage::Binary(bytes))) => bytes,
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return lost(ever_synced, "closed by server".to_string());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return lost(ever_synced, e.to_string()),
                    };
                    let message = match protocol::decode(&bytes) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Dropping undecodable frame: {}", e);
                            continue;
                        }
                    };
                    match message {
                        Message::Synced(synced_frame) => {
                            if let Err(e) = self.resync(synced_frame.full_state) {
                                error!("Resync failed: {}", e);
                                return lost(ever_synced, e.to_string());
                            }
                            synced = true;
                            ever_synced = true;
                            self.set_state(ConnectionState::Connected);
                            if let Err(e) = self.flush(&mut write).await {
                                return lost(ever_synced, e.to_string());
                            }
                            if let Err(e) = self.report_progress(&mut write, &mut reported).await {
                                return lost(ever_synced, e.to_string());
                            }
                        }
                        Message::Operation(frame) => {
                            if !synced {
                                // Covered by the SYNCED that answers our JOIN
                                debug!("Ignoring {} received before SYNCED", frame.op.id());
                                continue;
                            }
                            let result = self.replica.lock().receive(frame.op, Instant::now());
                            if let Err(e) = result {
                                warn!("Failed to apply remote operation: {}", e);
                            }
                        }
                        Message::Progress(ack) => {
                            let confirmed = self.replica.lock().confirm(&ack.vector_clock);
                            if confirmed > 0 {
                                debug!("Server confirmed {} local operations", confirmed);
                            }
                        }
                        Message::Error(err) if err.kind == ErrorKind::CausalDependencyMissing => {
                            warn!("Server requested resync: {}", err.message);
                            synced = false;
                            if let Err(e) = self.send_join(&mut write).await {
                                return lost(ever_synced, e.to_string());
                            }
                        }
                        Message::Error(err) => {
                            warn!("Server error ({:?}): {}", err.kind, err.message);
                        }
                        other => debug!("Unexpected {} from server", other.name()),
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Flush) => {
                        if synced {
                            if let Err(e) = self.flush(&mut write).await {
                                return lost(ever_synced, e.to_string());
                            }
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },
                _ = progress.tick() => {
                    if synced {
                        if let Err(e) = self.report_progress(&mut write, &mut reported).await {
                            return lost(ever_synced, e.to_string());
                        }
                    }
                }
                _ = expiry.tick() => {
                    let expired = self.replica.lock().expire_pending(Instant::now());
                    if !expired.is_empty() && synced {
                        warn!("Causal timeout with {} operations; rejoining", expired.len());
                        synced = false;
                        if let Err(e) = self.send_join(&mut write).await {
                            return lost(ever_synced, e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Replaces the replica with the server state and rewrites the queue with
    /// everything the server still lacks.
    fn resync(&self, state: DocumentState) -> Result<()> {
        let mut replica = self.replica.lock();
        let mut queue = self.queue.lock();
        let pending: Vec<Operation> = queue.iter().cloned().collect();
        let resend = replica.resync(state, pending)?;
        info!(
            "Synced {} ({} chars, {} local operations to send)",
            self.config.document_id,
            replica.len(),
            resend.len()
        );
        queue.replace(resend)
    }

    /// Sends queued operations in order, removing each only once it has been
    /// written to the socket.
    async fn flush<S>(&self, write: &mut S) -> Result<()>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: fmt::Display,
    {
        loop {
            let next = self.queue.lock().front().cloned();
            let Some(op) = next else {
                return Ok(());
            };
            send(write, &Message::operation(op)).await?;
            self.queue.lock().pop_front()?;
        }
    }

    async fn send_join(&self, write: &mut WsSink) -> Result<()> {
        let join = {
            let replica = self.replica.lock();
            Message::join(
                self.config.document_id.clone(),
                replica.site_id(),
                replica.clock().clone(),
            )
        };
        send(write, &join).await
    }

    async fn report_progress(
        &self,
        write: &mut WsSink,
        reported: &mut Option<VectorClock>,
    ) -> Result<()> {
        let clock = self.replica.lock().clock().clone();
        if reported.as_ref() == Some(&clock) {
            return Ok(());
        }
        // Own operations counted in `clock` must reach the server first
        self.flush(write).await?;
        send(write, &Message::progress(clock.clone())).await?;
        *reported = Some(clock);
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Connection state: {:?}", state);
        self.state.send_replace(state);
    }
}

async fn send<S>(write: &mut S, message: &Message) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: fmt::Display,
{
    let frame = protocol::encode(message)?;
    write
        .send(WsMessage::Binary(frame))
        .await
        .map_err(|e| CrdtError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Backoff;

    #[test]
    fn test_connection_state_serializes_tagged() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting { attempt: 3 }).unwrap();
        assert!(json.contains(r#""type":"reconnecting""#));
        assert!(json.contains(r#""attempt":3"#));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::new(format!("ws://{}/ws", addr), "doc")
            .with_site_id("a")
            .with_backoff(Backoff::new(
                Duration::from_millis(5),
                Duration::from_millis(10),
                2,
            ));
        let client = SyncClient::start(config).unwrap();
        let mut state = client.subscribe();
        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, ConnectionState::Failed { .. })),
        )
        .await;
        assert!(matches!(failed, Ok(Ok(_))));

        // Edits still apply locally and wait in the queue
        client.insert(0, 'x').unwrap();
        assert_eq!(client.text(), "x");
        assert_eq!(client.queued(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_unsent_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let mut replica = Replica::new("a", Duration::from_secs(10));
        let mut queue = OfflineQueue::open(&path, "a").unwrap();
        for (i, ch) in "hello".chars().enumerate() {
            queue.push(replica.apply_local_insert(i, ch).unwrap()).unwrap();
        }
        let (_commands_tx, commands) = mpsc::unbounded_channel();
        let (state, _state_rx) = watch::channel(ConnectionState::Connected);
        let worker = Worker {
            config: ClientConfig::new("ws://127.0.0.1:1/ws", "doc").with_site_id("a"),
            replica: Arc::new(Mutex::new(replica)),
            queue: Arc::new(Mutex::new(queue)),
            commands,
            state,
        };
        let delivered = Arc::new(Mutex::new(Vec::new()));

        // The connection resets after two frames
        let mut dropping = Box::pin(futures_util::sink::unfold(0usize, {
            let delivered = Arc::clone(&delivered);
            move |sent, frame: WsMessage| {
                let delivered = Arc::clone(&delivered);
                async move {
                    if sent == 2 {
                        return Err(CrdtError::Transport("connection reset".to_string()));
                    }
                    delivered.lock().push(frame);
                    Ok(sent + 1)
                }
            }
        }));
        assert!(worker.flush(&mut dropping).await.is_err());
        assert_eq!(delivered.lock().len(), 2);

        // The unsent remainder is on disk, in order
        let reopened = OfflineQueue::open(&path, "a").unwrap();
        let counters: Vec<u64> = reopened.iter().map(Operation::counter).collect();
        assert_eq!(counters, vec![3, 4, 5]);

        // The next connection sends exactly the remainder
        let mut healthy = Box::pin(futures_util::sink::unfold((), {
            let delivered = Arc::clone(&delivered);
            move |(), frame: WsMessage| {
                let delivered = Arc::clone(&delivered);
                async move {
                    delivered.lock().push(frame);
                    Ok::<_, CrdtError>(())
                }
            }
        }));
        worker.flush(&mut healthy).await.unwrap();
        assert!(worker.queue.lock().is_empty());

        let counters: Vec<u64> = delivered
            .lock()
            .iter()
            .map(|frame| match frame {
                WsMessage::Binary(bytes) => match protocol::decode(bytes).unwrap() {
                    Message::Operation(frame) => frame.op.counter(),
                    other => panic!("unexpected {}", other.name()),
                },
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(counters, vec![1, 2, 3, 4, 5]);
    }
}
