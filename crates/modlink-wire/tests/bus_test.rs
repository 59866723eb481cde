//! Integration tests for the transport bus.
//!
//! Every test runs a real server and real clients over loopback TCP (or a
//! Unix-domain socket) bound to an ephemeral port; nothing outside the
//! process is contacted.

use modlink_codec::{BinaryCodec, MessageCodec};
use modlink_types::{Message, MessageType, ModuleAddress, Object, Value, BROADCAST_UID};
use modlink_wire::{Bus, WireError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_server() -> (Bus, String) {
    let server = Bus::from_connection("server:tcp://127.0.0.1:0").unwrap();
    server.activate().await.unwrap();
    let url = server.local_endpoint().unwrap();
    (server, url)
}

async fn start_client(url: &str, uid: u64, name: &str) -> Bus {
    let client = Bus::from_connection(&format!("client:{url}")).unwrap();
    client.set_identity(ModuleAddress::new(uid, name, "test"));
    client.activate().await.unwrap();
    client
}

/// Collects every message of one type a bus receives.
fn record(bus: &Bus, kind: MessageType) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.add_message_handler(kind, move |m| {
        sink.lock().unwrap().push(m.clone());
        true
    });
    seen
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn wait_for_peers(bus: &Bus, count: usize) -> bool {
    for _ in 0..300 {
        if bus.peer_count().await == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn fields(key: &str, value: impl Into<Value>) -> Object {
    let mut object = Object::new();
    object.insert(key.to_string(), value.into());
    object
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_echo_request_gets_reply() {
    let (server, url) = start_server().await;
    let client = start_client(&url, 1001, "echo-client").await;
    let replies = record(&client, MessageType::EchoReply);

    client
        .send_fields(MessageType::EchoRequest, Object::new(), BROADCAST_UID, 2000)
        .await
        .unwrap();

    assert!(wait_until(|| !replies.lock().unwrap().is_empty()).await);
    let reply = replies.lock().unwrap()[0].clone();
    assert_eq!(reply.receiver().uid, 1001);
    assert_eq!(reply.sender().uid, server.identity().uid);

    client.deactivate().await;
    server.deactivate().await;
}

#[tokio::test]
async fn test_busy_address_is_transport_error() {
    let (server, url) = start_server().await;

    let second = Bus::from_connection(&format!("server:{url}")).unwrap();
    let err = second.activate().await.unwrap_err();
    assert!(matches!(err, WireError::Transport(_)), "{err}");
    assert!(!second.is_active());

    server.deactivate().await;
}

#[tokio::test]
async fn test_unconnected_client_send() {
    // Nothing listens on port 1.
    let client = Bus::from_connection("client:tcp://127.0.0.1:1").unwrap();
    client.activate().await.unwrap();

    let started = std::time::Instant::now();
    let err = client.send(b"hello", 0).await.unwrap_err();
    assert!(matches!(err, WireError::Transport(_)), "{err}");
    assert!(started.elapsed() < Duration::from_millis(500));

    let err = client.send(b"hello", 50).await.unwrap_err();
    assert!(matches!(err, WireError::Timeout { timeout_ms: 50 }), "{err}");

    client.deactivate().await;
}

#[tokio::test]
async fn test_server_broadcast_reaches_clients() {
    let (server, url) = start_server().await;
    let first = start_client(&url, 2001, "first").await;
    let second = start_client(&url, 2002, "second").await;
    let first_seen = record(&first, MessageType::Event);
    let second_seen = record(&second, MessageType::Event);
    assert!(wait_for_peers(&server, 2).await);

    server
        .send_fields(MessageType::Event, fields("tick", 1i32), BROADCAST_UID, 1000)
        .await
        .unwrap();

    assert!(wait_until(|| first_seen.lock().unwrap().len() == 1).await);
    assert!(wait_until(|| second_seen.lock().unwrap().len() == 1).await);
    assert_eq!(
        first_seen.lock().unwrap()[0].get_fields()["tick"],
        Value::Int32(1)
    );

    first.deactivate().await;
    second.deactivate().await;
    server.deactivate().await;
}

#[tokio::test]
async fn test_multipart_message_is_reassembled() {
    let (server, url) = start_server().await;
    let seen = record(&server, MessageType::Action);
    let client = start_client(&url, 3001, "multipart").await;

    let message = Message::new(MessageType::Action, fields("payload", "split me"));
    let bytes = BinaryCodec::strict().serialize_message(&message).unwrap();
    let (head, tail) = bytes.split_at(bytes.len() / 2);
    client.send_multipart(&[head, tail], 2000).await.unwrap();

    assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
    assert_eq!(
        seen.lock().unwrap()[0].get_fields()["payload"],
        Value::from("split me")
    );

    client.deactivate().await;
    server.deactivate().await;
}

#[tokio::test]
async fn test_server_relays_between_clients() {
    let (server, url) = start_server().await;
    let alpha = start_client(&url, 4001, "alpha").await;
    let beta = start_client(&url, 4002, "beta").await;
    let alpha_actions = record(&alpha, MessageType::Action);
    let alpha_events = record(&alpha, MessageType::Event);
    let beta_events = record(&beta, MessageType::Event);
    assert!(wait_for_peers(&server, 2).await);

    // Notification fans out to every other peer.
    alpha
        .send_fields(MessageType::Event, fields("from", "alpha"), BROADCAST_UID, 1000)
        .await
        .unwrap();
    assert!(wait_until(|| beta_events.lock().unwrap().len() == 1).await);
    assert_eq!(beta_events.lock().unwrap()[0].sender().uid, 4001);

    // The server now knows where 4001 lives; directed traffic goes there.
    beta.send_fields(MessageType::Action, fields("from", "beta"), 4001, 1000)
        .await
        .unwrap();
    assert!(wait_until(|| alpha_actions.lock().unwrap().len() == 1).await);
    assert_eq!(alpha_actions.lock().unwrap()[0].receiver().uid, 4001);

    // The origin never gets its own message back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alpha_events.lock().unwrap().is_empty());

    alpha.deactivate().await;
    beta.deactivate().await;
    server.deactivate().await;
}

#[tokio::test]
async fn test_handler_can_stop_dispatch() {
    let (server, url) = start_server().await;
    let client = start_client(&url, 5001, "quiet").await;
    let blocked = record(&client, MessageType::EchoReply);

    // Consume echo requests before the built-in reply runs.
    server.add_message_handler(MessageType::EchoRequest, |_| false);
    let echoes = record(&server, MessageType::EchoRequest);

    client
        .send_fields(MessageType::EchoRequest, Object::new(), BROADCAST_UID, 2000)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(blocked.lock().unwrap().is_empty());
    assert!(echoes.lock().unwrap().is_empty());

    client.deactivate().await;
    server.deactivate().await;
}

#[tokio::test]
async fn test_removed_handler_is_not_called() {
    let (server, url) = start_server().await;
    let seen = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&seen);
    let id = server.add_message_handler(MessageType::Event, move |_| {
        *counter.lock().unwrap() += 1;
        true
    });
    let after = record(&server, MessageType::Event);
    assert!(server.remove_message_handler(id));

    let client = start_client(&url, 6001, "events").await;
    client
        .send_fields(MessageType::Event, Object::new(), BROADCAST_UID, 2000)
        .await
        .unwrap();

    assert!(wait_until(|| after.lock().unwrap().len() == 1).await);
    assert_eq!(*seen.lock().unwrap(), 0);

    client.deactivate().await;
    server.deactivate().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    let (server, url) = start_server().await;
    let client = start_client(&url, 7001, "persistent").await;
    assert!(wait_for_peers(&server, 1).await);

    server.deactivate().await;
    let restarted = Bus::from_connection(&format!("server:{url}")).unwrap();
    let seen = record(&restarted, MessageType::Event);
    restarted.activate().await.unwrap();

    assert!(wait_for_peers(&restarted, 1).await);
    client
        .send_fields(MessageType::Event, fields("again", true), BROADCAST_UID, 2000)
        .await
        .unwrap();
    assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);

    client.deactivate().await;
    restarted.deactivate().await;
}

#[tokio::test]
async fn test_send_after_deactivate_fails() {
    let (server, url) = start_server().await;
    let client = start_client(&url, 8001, "gone").await;
    client.deactivate().await;
    client.deactivate().await;

    let err = client.send(b"late", 0).await.unwrap_err();
    assert!(matches!(err, WireError::Inactive));
    server.deactivate().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_ipc_transport() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modlink.sock");
    let url = format!("ipc://{}", path.display());

    let server = Bus::from_connection(&format!("server:{url}")).unwrap();
    server.activate().await.unwrap();
    assert!(path.exists());

    let client = start_client(&url, 9001, "ipc-client").await;
    let replies = record(&client, MessageType::EchoReply);
    client
        .send_fields(MessageType::EchoRequest, Object::new(), BROADCAST_UID, 2000)
        .await
        .unwrap();
    assert!(wait_until(|| replies.lock().unwrap().len() == 1).await);

    client.deactivate().await;
    server.deactivate().await;
    assert!(!path.exists());
}
