//! WebSocket session handling for collaborative editing.
//!
//! One [`WebSocketSession`] runs per connection. The first frame must be a
//! `JOIN`; after that the session relays frames between the socket and the
//! document actor until either side goes away.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actor::DocumentHandle;
use super::routes::AppState;
use crate::error::{CrdtError, ErrorKind, Result};
use crate::protocol::{self, Join, Message};

type WsSender = SplitSink<WebSocket, WsMessage>;
type WsReceiver = SplitStream<WebSocket>;

/// WebSocket session manager
pub struct WebSocketSession {
    socket: WebSocket,
    state: AppState,
    connection_id: String,
}

impl WebSocketSession {
    /// Create a new WebSocket session
    pub fn new(socket: WebSocket, state: AppState, connection_id: String) -> Self {
        Self {
            socket,
            state,
            connection_id,
        }
    }

    /// Handle the WebSocket connection lifecycle
    pub async fn handle(self) {
        let connection_id = self.connection_id;
        let (mut sender, mut receiver) = self.socket.split();
        info!("WebSocket connection {} established", connection_id);

        let Some(join) = wait_for_join(&mut sender, &mut receiver, &connection_id).await else {
            info!("WebSocket connection {} closed before JOIN", connection_id);
            return;
        };
        let document_id = join.document_id.clone();
        let site_id = join.site_id.clone();
        let document = self.state.handle(&document_id);
        let (outbound, mut peer_messages) = mpsc::unbounded_channel();

        if let Err(e) = sync(&mut sender, &document, join, &connection_id, &outbound).await {
            error!("Failed to sync {} on {}: {}", site_id, document_id, e);
            let _ = send_message(&mut sender, &Message::from(&e)).await;
            return;
        }
        info!(
            "Connection {} is site {} on {}",
            connection_id, site_id, document_id
        );

        loop {
            tokio::select! {
                frame = receiver.next() => {
                    let data = match frame {
                        Some(Ok(WsMessage::Binary(data))) => data,
                        Some(Ok(WsMessage::Text(_))) => {
                            let reply = Message::error(
                                ErrorKind::InvalidOperation,
                                "text frames are not supported",
                            );
                            if send_message(&mut sender, &reply).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if let Err(e) = sender.send(WsMessage::Pong(data)).await {
                                error!("Failed to send pong to {}: {}", connection_id, e);
                                break;
                            }
                            continue;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            info!("WebSocket connection {} closed by client", connection_id);
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("WebSocket error for {}: {}", connection_id, e);
                            break;
                        }
                    };

                    let result = match protocol::decode(&data) {
                        Ok(Message::Operation(frame)) => document.submit(site_id.clone(), frame.op),
                        Ok(Message::Progress(progress)) => {
                            document.progress(site_id.clone(), progress.vector_clock)
                        }
                        Ok(Message::Join(join)) => {
                            if join.document_id != document_id || join.site_id != site_id {
                                Err(CrdtError::InvalidOperation(
                                    "a connection cannot switch document or site".to_string(),
                                ))
                            } else {
                                debug!("{} rejoining {}", site_id, document_id);
                                sync(&mut sender, &document, join, &connection_id, &outbound).await
                            }
                        }
                        Ok(other) => Err(CrdtError::InvalidOperation(format!(
                            "clients may not send {}",
                            other.name()
                        ))),
                        Err(e) => Err(e),
                    };

                    if let Err(e) = result {
                        if matches!(e, CrdtError::Transport(_)) {
                            error!("Document {} is unavailable: {}", document_id, e);
                            let _ = send_message(&mut sender, &Message::from(&e)).await;
                            break;
                        }
                        warn!("Rejected frame from {}: {}", site_id, e);
                        if send_message(&mut sender, &Message::from(&e)).await.is_err() {
                            break;
                        }
                    }
                }
                message = peer_messages.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Err(e) = send_message(&mut sender, &message).await {
                        warn!("Failed to forward to {}: {}", connection_id, e);
                        break;
                    }
                }
            }
        }

        document.leave(site_id.clone(), connection_id.clone());
        info!(
            "WebSocket connection {} ({} on {}) ended",
            connection_id, site_id, document_id
        );
    }
}

/// Reads frames until a `JOIN` arrives. Any other message ends the
/// connection with an error.
async fn wait_for_join(
    sender: &mut WsSender,
    receiver: &mut WsReceiver,
    connection_id: &str,
) -> Option<Join> {
    while let Some(frame) = receiver.next().await {
        let data = match frame {
            Ok(WsMessage::Binary(data)) => data,
            Ok(WsMessage::Ping(data)) => {
                sender.send(WsMessage::Pong(data)).await.ok()?;
                continue;
            }
            Ok(WsMessage::Close(_)) => return None,
            Ok(WsMessage::Text(_)) | Ok(WsMessage::Pong(_)) => continue,
            Err(e) => {
                warn!("WebSocket error for {}: {}", connection_id, e);
                return None;
            }
        };
        let error = match protocol::decode(&data) {
            Ok(Message::Join(join)) => return Some(join),
            Ok(other) => Message::error(
                ErrorKind::InvalidOperation,
                format!("expected JOIN, got {}", other.name()),
            ),
            Err(e) => Message::from(&e),
        };
        let _ = send_message(sender, &error).await;
        return None;
    }
    None
}

/// Registers the connection with the document actor and sends `SYNCED`.
async fn sync(
    sender: &mut WsSender,
    document: &DocumentHandle,
    join: Join,
    connection_id: &str,
    outbound: &mpsc::UnboundedSender<Message>,
) -> Result<()> {
    let state = document
        .join(
            join.site_id,
            connection_id,
            join.vector_clock,
            outbound.clone(),
        )
        .await?;
    send_message(sender, &Message::synced(state)).await
}

async fn send_message(sender: &mut WsSender, message: &Message) -> Result<()> {
    let frame = protocol::encode(message)?;
    sender
        .send(WsMessage::Binary(frame))
        .await
        .map_err(|e| CrdtError::Transport(e.to_string()))
}

/// Generate a unique connection ID
pub fn generate_connection_id() -> String {
    format!("conn_{}", Uuid::new_v4().simple())
}

/// Create and handle a new WebSocket session
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState) {
    let connection_id = generate_connection_id();
    let session = WebSocketSession::new(socket, state, connection_id);
    session.handle().await;
}
