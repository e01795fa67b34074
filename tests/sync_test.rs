//! End-to-end tests: a real server on a loopback port and `SyncClient`s
//! talking to it over WebSocket.

use crdt_collab::protocol::{self, Message};
use crdt_collab::server::{self, DocumentRegistry};
use crdt_collab::{
    Backoff, ClientConfig, ConnectionState, ErrorKind, MemoryLog, NodeId, Operation, OperationLog,
    ServerConfig, SyncClient, VectorClock,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(10);

fn server_config() -> ServerConfig {
    ServerConfig {
        gc_interval: Duration::from_secs(3600),
        ..ServerConfig::default()
    }
}

async fn start_server(listener: TcpListener) -> Arc<DocumentRegistry> {
    let log: Arc<dyn OperationLog> = Arc::new(MemoryLog::new());
    let registry = Arc::new(DocumentRegistry::new(log, server_config()));
    let state = Arc::clone(&registry);
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, state).await {
            panic!("server stopped: {}", e);
        }
    });
    registry
}

async fn spawn_server() -> (SocketAddr, Arc<DocumentRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, start_server(listener).await)
}

/// Config with a generated site id.
fn fresh_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(format!("ws://{}/ws", addr), "doc").with_backoff(Backoff::new(
        Duration::from_millis(20),
        Duration::from_millis(200),
        100,
    ))
}

fn client_config(addr: SocketAddr, site: &str) -> ClientConfig {
    fresh_config(addr).with_site_id(site)
}

fn closed_port() -> SocketAddr {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    reserved.local_addr().unwrap()
}

async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_connected(client: &SyncClient) {
    let mut state = client.subscribe();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("client did not connect")
        .unwrap();
}

async fn server_text(registry: &DocumentRegistry) -> String {
    registry.handle("doc").stats().await.unwrap().text
}

fn type_text(client: &SyncClient, offset: usize, text: &str) {
    for (i, ch) in text.chars().enumerate() {
        client.insert(offset + i, ch).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_clients_converge() {
    let (addr, registry) = spawn_server().await;
    let alice = SyncClient::start(client_config(addr, "alice")).unwrap();
    let bob = SyncClient::start(client_config(addr, "bob")).unwrap();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    type_text(&alice, 0, "hello");
    eventually("bob to see alice's text", || bob.text() == "hello").await;

    // Concurrent edits at both ends of the document
    alice.insert(5, '!').unwrap();
    bob.insert(0, '>').unwrap();
    eventually("both clients to converge", || {
        alice.text() == ">hello!" && bob.text() == ">hello!"
    })
    .await;
    assert_eq!(server_text(&registry).await, ">hello!");
    assert_eq!(alice.queued(), 0);

    // Progress acknowledgements release the sent operations
    eventually("the server to confirm alice's edits", || alice.unconfirmed() == 0).await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_changes_reach_callback() {
    let (addr, _registry) = spawn_server().await;
    let alice = SyncClient::start(client_config(addr, "alice")).unwrap();
    let bob = SyncClient::start(client_config(addr, "bob")).unwrap();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    bob.on_remote_change({
        let seen = Arc::clone(&seen);
        move |change| seen.lock().push(change.clone())
    });

    type_text(&alice, 0, "ab");
    alice.delete(0).unwrap();
    eventually("bob to apply three changes", || seen.lock().len() == 3).await;
    assert_eq!(bob.text(), "b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_edits_replay_when_server_appears() {
    // Reserve a port, then leave it closed until the client has queued edits
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let client = SyncClient::start(client_config(addr, "alice")).unwrap();
    type_text(&client, 0, "offline");
    assert_eq!(client.text(), "offline");
    assert_eq!(client.queued(), 7);
    assert_ne!(client.state(), ConnectionState::Connected);

    let listener = TcpListener::bind(addr).await.unwrap();
    let registry = start_server(listener).await;

    wait_connected(&client).await;
    eventually("the queue to drain", || client.queued() == 0).await;
    let deadline = Instant::now() + WAIT;
    while server_text(&registry).await != "offline" {
        assert!(Instant::now() < deadline, "server never received the edits");
        sleep(Duration::from_millis(20)).await;
    }
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_durable_queue_outlives_client() {
    let dir = tempfile::tempdir().unwrap();
    let queue_path = dir.path().join("alice.queue.json");

    let closed = closed_port();

    // Edit with no server, then quit
    let offline = SyncClient::start(
        client_config(closed, "alice").with_offline_queue(&queue_path),
    )
    .unwrap();
    type_text(&offline, 0, "saved");
    offline.shutdown().await;

    // Same site and queue file, now with a server
    let (addr, registry) = spawn_server().await;
    let client =
        SyncClient::start(client_config(addr, "alice").with_offline_queue(&queue_path)).unwrap();
    assert_eq!(client.queued(), 5);
    wait_connected(&client).await;
    eventually("the queue to drain", || client.queued() == 0).await;

    let deadline = Instant::now() + WAIT;
    while server_text(&registry).await != "saved" {
        assert!(Instant::now() < deadline, "queued edits never arrived");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.text(), "saved");
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_with_generated_site_keeps_queued_edits() {
    let dir = tempfile::tempdir().unwrap();
    let queue_path = dir.path().join("editor.queue.json");

    let offline =
        SyncClient::start(fresh_config(closed_port()).with_offline_queue(&queue_path)).unwrap();
    let site = offline.site_id();
    type_text(&offline, 0, "draft");
    offline.shutdown().await;

    // A new process generates a new site id; the queue keeps the old one
    let (addr, registry) = spawn_server().await;
    let client = SyncClient::start(fresh_config(addr).with_offline_queue(&queue_path)).unwrap();
    assert_eq!(client.site_id(), site);
    assert_eq!(client.queued(), 5);
    wait_connected(&client).await;
    eventually("the queue to drain", || client.queued() == 0).await;

    let deadline = Instant::now() + WAIT;
    while server_text(&registry).await != "draft" {
        assert!(Instant::now() < deadline, "queued edits never arrived");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.text(), "draft");
    assert_eq!(client.clock().get(&site), 5);
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_progress_reports_unlock_gc() {
    let (addr, registry) = spawn_server().await;
    let alice = SyncClient::start(client_config(addr, "alice")).unwrap();
    let bob = SyncClient::start(client_config(addr, "bob")).unwrap();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    type_text(&alice, 0, "abc");
    alice.delete(2).unwrap();
    eventually("bob to see the delete", || bob.text() == "ab").await;

    // Both sites report their clocks on the progress tick
    let handle = registry.handle("doc");
    let deadline = Instant::now() + WAIT;
    loop {
        handle.collect_garbage().await.unwrap();
        if handle.stats().await.unwrap().tombstones == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "tombstone was never collected");
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(server_text(&registry).await, "ab");

    // Collection is invisible to the clients
    bob.insert(2, 'd').unwrap();
    eventually("alice to see bob's edit", || alice.text() == "abd").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_protocol_session() {
    let (addr, _registry) = spawn_server().await;
    let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    async fn next_message(
        socket: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
    ) -> Message {
        loop {
            let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
            if let WsMessage::Binary(bytes) = frame {
                return protocol::decode(&bytes).unwrap();
            }
        }
    }

    let join = Message::join("doc", "raw", VectorClock::new());
    socket
        .send(WsMessage::Binary(protocol::encode(&join).unwrap()))
        .await
        .unwrap();
    let Message::Synced(synced) = next_message(&mut socket).await else {
        panic!("expected SYNCED");
    };
    assert!(synced.full_state.nodes.is_empty());

    // Another site's identity is refused
    let forged = Message::operation(Operation::insert(NodeId::new("mallory", 1), None, 'x'));
    socket
        .send(WsMessage::Binary(protocol::encode(&forged).unwrap()))
        .await
        .unwrap();
    let Message::Error(err) = next_message(&mut socket).await else {
        panic!("expected ERROR");
    };
    assert_eq!(err.kind, ErrorKind::InvalidOperation);

    socket
        .send(WsMessage::Text("hello".to_string()))
        .await
        .unwrap();
    let Message::Error(err) = next_message(&mut socket).await else {
        panic!("expected ERROR");
    };
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, registry) = spawn_server().await;
    let _document = registry.handle("doc");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""documents":1"#));
}
