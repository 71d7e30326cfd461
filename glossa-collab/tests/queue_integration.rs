//! Offline delivery: queueing while disconnected, ordered replay on
//! reconnect, ephemeral traffic never surviving a disconnection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use glossa_collab::client::{ClientEvent, SyncClient};
use glossa_collab::protocol::{CursorState, Identity, Role, ServerMessage};
use glossa_collab::registry::Registry;
use glossa_collab::room::DeliveryStatus;
use glossa_collab::server::{CollabServer, ServerConfig};
use glossa_core::{Annotation, AnnotationStatus, Span};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port; keep the registry for direct delivery.
async fn start_test_server() -> (u16, Arc<Registry>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = CollabServer::new(config, Arc::new(glossa_collab::persist::MemoryStore::new()));
    let registry = server.registry().clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, registry)
}

fn identity(n: u128) -> Identity {
    Identity {
        user: Uuid::from_u128(n),
        role: Role::Annotator,
    }
}

async fn connect_client(
    name: &str,
    ident: Identity,
    room: Uuid,
    port: u16,
) -> (SyncClient, mpsc::Receiver<ClientEvent>) {
    let url = format!("ws://127.0.0.1:{port}");
    let mut client = SyncClient::new(ident, name, room, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |msg| {
        matches!(msg, ServerMessage::RoomState { .. }).then_some(())
    })
    .await;
    (client, events)
}

async fn wait_for<F, T>(events: &mut mpsc::Receiver<ClientEvent>, mut pred: F) -> T
where
    F: FnMut(&ServerMessage) -> Option<T>,
{
    let deadline = Duration::from_secs(5);
    loop {
        let event = timeout(deadline, events.recv())
            .await
            .expect("timed out waiting for a matching server message")
            .expect("event channel closed");
        if let ClientEvent::Server { message, .. } = event {
            if let Some(out) = pred(&message) {
                return out;
            }
        }
    }
}

fn annotation_update(id: u128) -> ServerMessage {
    ServerMessage::AnnotationUpdated {
        annotation: Annotation {
            id: Uuid::from_u128(id),
            span: Span::new(id as u64 * 10, id as u64 * 10 + 5).unwrap(),
            labels: BTreeSet::from(["PERSON".to_string()]),
            author: Uuid::from_u128(1),
            version: id as u64,
            status: AnnotationStatus::Active,
            modified_at_ms: 0,
        },
    }
}

#[tokio::test]
async fn test_reconnect_replays_queued_messages_in_order() {
    // A user disconnects with 5 normal-priority messages enqueued; on
    // reconnect exactly those 5 arrive in original order, and cursor
    // updates generated meanwhile are absent.
    let (port, registry) = start_test_server().await;
    let room = Uuid::new_v4();
    let offline_user = Uuid::from_u128(2);

    let (_alice, _alice_events) = connect_client("Alice", identity(1), room, port).await;
    let (bob, bob_events) = connect_client("Bob", identity(2), room, port).await;

    bob.disconnect().await;
    drop(bob_events);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Five annotation updates accumulate for the offline user
    for i in 1..=5u128 {
        let status = registry
            .direct_message(offline_user, room, annotation_update(i))
            .await;
        assert_eq!(status, DeliveryStatus::Queued);
    }

    // Cursor traffic during the disconnection is ephemeral: dropped
    registry
        .direct_message(
            offline_user,
            room,
            ServerMessage::CursorMoved {
                user: Uuid::from_u128(1),
                cursor: CursorState {
                    position: 3,
                    selection: None,
                },
            },
        )
        .await;

    assert_eq!(registry.queue().len(offline_user).await, 5);

    // Reconnect: the replay announces itself, then delivers in order
    let (_bob2, mut bob_events) = connect_client("Bob", identity(2), room, port).await;

    let count = wait_for(&mut bob_events, |msg| match msg {
        ServerMessage::QueuedNotification { count } => Some(*count),
        _ => None,
    })
    .await;
    assert_eq!(count, 5);

    let mut delivered = Vec::new();
    while delivered.len() < 5 {
        let id = wait_for(&mut bob_events, |msg| match msg {
            ServerMessage::AnnotationUpdated { annotation } => Some(annotation.id),
            ServerMessage::CursorMoved { .. } => {
                panic!("ephemeral message must not survive a disconnection")
            }
            _ => None,
        })
        .await;
        delivered.push(id);
    }

    let expected: Vec<Uuid> = (1..=5u128).map(Uuid::from_u128).collect();
    assert_eq!(delivered, expected);
    assert_eq!(registry.queue().len(offline_user).await, 0);
}

#[tokio::test]
async fn test_critical_messages_replay_before_normal() {
    let (port, registry) = start_test_server().await;
    let room = Uuid::new_v4();
    let offline_user = Uuid::from_u128(2);

    let (_alice, _alice_events) = connect_client("Alice", identity(1), room, port).await;

    // Normal first, then a critical failure notice
    registry
        .direct_message(offline_user, room, annotation_update(1))
        .await;
    registry
        .direct_message(
            offline_user,
            room,
            ServerMessage::OperationFailed {
                request: Uuid::new_v4(),
                code: glossa_collab::error::ErrorCode::PersistenceDegraded,
                reason: "storage collaborator unreachable".to_string(),
            },
        )
        .await;

    let (_bob, mut bob_events) = connect_client("Bob", identity(2), room, port).await;

    wait_for(&mut bob_events, |msg| {
        matches!(msg, ServerMessage::QueuedNotification { count: 2 }).then_some(())
    })
    .await;

    // Critical tier drains first despite being enqueued later
    wait_for(&mut bob_events, |msg| {
        matches!(msg, ServerMessage::OperationFailed { .. }).then_some(())
    })
    .await;
    wait_for(&mut bob_events, |msg| {
        matches!(msg, ServerMessage::AnnotationUpdated { .. }).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_unreachable_broadcast_recipient_falls_back_to_queue() {
    let (_port, registry) = start_test_server().await;
    let room = Uuid::new_v4();
    let user = Uuid::from_u128(9);

    // Join through the registry with a hand-made outbox, then kill the
    // receiving side so the connection turns unreachable.
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    registry
        .join(conn, identity(9), "Ghost", room, tx)
        .await
        .unwrap();
    // Drain the snapshot, then drop the receiver
    let _ = rx.recv().await;
    drop(rx);

    registry
        .broadcast(room, annotation_update(3), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The fan-out dropped the dead connection and queued the message
    assert_eq!(registry.queue().len(user).await, 1);
    assert_eq!(registry.connection_count().await, 1); // stale routing entry is fine
}
