//! WebSocket client for the coordinator.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Typed request helpers for every inbound message
//! - A typed event stream of sequenced server frames
//! - Baseline tracking for span operations (`seen_seq`)
//!
//! Client transports embed this; the integration suites drive it against a
//! real server.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use glossa_core::{AnnotationDraft, AnnotationPatch, OpKind, Operation, ResolutionStrategy};

use crate::error::CollabError;
use crate::protocol::{
    ClientMessage, CursorState, Identity, ServerFrame, ServerMessage,
};
use crate::room::now_ms;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A sequenced frame from the coordinator.
    Server { seq: u64, message: ServerMessage },
}

/// The coordinator client.
pub struct SyncClient {
    identity: Identity,
    name: String,
    room: Uuid,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    /// Last room operation sequence observed, the baseline for our own ops.
    seen_seq: Arc<RwLock<u64>>,

    outgoing_tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(
        identity: Identity,
        name: impl Into<String>,
        room: Uuid,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            identity,
            name: name.into(),
            room,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            seen_seq: Arc::new(RwLock::new(0)),
            outgoing_tx: Arc::new(Mutex::new(None)),
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the room.
    ///
    /// Spawns background tasks for the WebSocket reader and writer; events
    /// start flowing on the receiver taken via [`Self::take_event_rx`].
    pub async fn connect(&self) -> Result<(), CollabError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|e| CollabError::Protocol(format!("connect failed: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                let msg = tokio_tungstenite::tungstenite::Message::Binary(data.into());
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });
        *self.outgoing_tx.lock().await = Some(out_tx.clone());

        // Join is always the first message.
        let join = ClientMessage::Join {
            room: self.room,
            identity: self.identity,
            name: self.name.clone(),
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| CollabError::Protocol("connection closed during join".to_string()))?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode frames, track the op baseline, emit events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let seen_seq = self.seen_seq.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(frame) => {
                                if let ServerMessage::OperationApplied { seq, .. } = &frame.body {
                                    *seen_seq.write().await = *seq;
                                }
                                let event = ClientEvent::Server {
                                    seq: frame.seq,
                                    message: frame.body,
                                };
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("undecodable server frame: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Leave the room and drop the connection.
    pub async fn disconnect(&self) {
        let _ = self.send(ClientMessage::Leave).await;
        *self.outgoing_tx.lock().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, message: ClientMessage) -> Result<(), CollabError> {
        let encoded = message.encode()?;
        let guard = self.outgoing_tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| CollabError::Protocol("not connected".to_string()))?;
        tx.send(encoded)
            .await
            .map_err(|_| CollabError::Protocol("connection closed".to_string()))
    }

    // ── request helpers; each returns its request id ─────────────────

    pub async fn create_annotation(&self, draft: AnnotationDraft) -> Result<Uuid, CollabError> {
        let request = Uuid::new_v4();
        self.send(ClientMessage::CreateAnnotation { request, draft })
            .await?;
        Ok(request)
    }

    pub async fn update_annotation(
        &self,
        annotation: Uuid,
        patch: AnnotationPatch,
    ) -> Result<Uuid, CollabError> {
        let request = Uuid::new_v4();
        self.send(ClientMessage::UpdateAnnotation {
            request,
            annotation,
            patch,
        })
        .await?;
        Ok(request)
    }

    pub async fn delete_annotation(&self, annotation: Uuid) -> Result<Uuid, CollabError> {
        let request = Uuid::new_v4();
        self.send(ClientMessage::DeleteAnnotation {
            request,
            annotation,
        })
        .await?;
        Ok(request)
    }

    pub async fn lock(&self, annotation: Uuid, ttl_ms: Option<u64>) -> Result<Uuid, CollabError> {
        let request = Uuid::new_v4();
        self.send(ClientMessage::Lock {
            request,
            annotation,
            ttl_ms,
        })
        .await?;
        Ok(request)
    }

    pub async fn unlock(&self, annotation: Uuid) -> Result<Uuid, CollabError> {
        let request = Uuid::new_v4();
        self.send(ClientMessage::Unlock {
            request,
            annotation,
        })
        .await?;
        Ok(request)
    }

    /// Fire an ephemeral cursor/selection update.
    pub async fn cursor_update(&self, cursor: CursorState) -> Result<(), CollabError> {
        self.send(ClientMessage::CursorUpdate { cursor }).await
    }

    /// Issue a span operation against the last seen room sequence.
    pub async fn text_operation(&self, kind: OpKind) -> Result<Uuid, CollabError> {
        let request = Uuid::new_v4();
        let seen_seq = *self.seen_seq.read().await;
        let op = Operation::new(self.identity.user, now_ms(), kind);
        self.send(ClientMessage::TextOperation {
            request,
            op,
            seen_seq,
        })
        .await?;
        Ok(request)
    }

    pub async fn resolve_conflict(
        &self,
        conflict: Uuid,
        strategy: ResolutionStrategy,
        winner: Option<Uuid>,
    ) -> Result<Uuid, CollabError> {
        let request = Uuid::new_v4();
        self.send(ClientMessage::ResolveConflict {
            request,
            conflict,
            strategy,
            winner,
        })
        .await?;
        Ok(request)
    }

    pub async fn vote(&self, conflict: Uuid, choice: Uuid) -> Result<(), CollabError> {
        self.send(ClientMessage::Vote { conflict, choice }).await
    }

    /// Acknowledge a received frame; doubles as an activity heartbeat.
    pub async fn ack(&self, seq: u64) -> Result<(), CollabError> {
        self.send(ClientMessage::Ack { seq }).await
    }

    pub async fn ping(&self) -> Result<(), CollabError> {
        self.send(ClientMessage::Ping).await
    }

    // ── accessors ────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn room(&self) -> Uuid {
        self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn seen_seq(&self) -> u64 {
        *self.seen_seq.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;

    fn client() -> SyncClient {
        SyncClient::new(
            Identity {
                user: Uuid::new_v4(),
                role: Role::Annotator,
            },
            "Tester",
            Uuid::new_v4(),
            "ws://127.0.0.1:9292",
        )
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Disconnected
        );
        assert_eq!(client.seen_seq().await, 0);
        assert_eq!(client.server_url(), "ws://127.0.0.1:9292");
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = client();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, CollabError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
