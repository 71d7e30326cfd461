//! WebSocket coordinator server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Registry (routing) ── Room task (owner) ── SyncEngine
//! Client B ──┘        │                      │                 │
//!                     │                      │            ConflictDetector
//!                     │                      │            OperationTransform
//!                     ▼                      ▼
//!               MessageQueue          PersistenceHandle ──► AnnotationStore
//!               (offline users)       (async, retried)      (external)
//! ```
//!
//! Each connection gets a reader (this task) and a writer task; the writer
//! owns the outbound sequence counter, so frames leave strictly ordered per
//! connection. The first message on a connection must be `Join` carrying a
//! pre-verified identity.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::CollabError;
use crate::persist::{AnnotationStore, MemoryStore, PersistenceHandle};
use crate::protocol::{ClientMessage, ServerFrame, ServerMessage};
use crate::queue::{MessageQueue, QueueConfig};
use crate::registry::Registry;
use crate::room::RoomConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound channel capacity per connection
    pub outbox_capacity: usize,
    pub room: RoomConfig,
    pub queue: QueueConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9292".to_string(),
            outbox_capacity: 256,
            room: RoomConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The coordinator server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server wired to the given persistence collaborator.
    pub fn new(config: ServerConfig, store: Arc<dyn AnnotationStore>) -> Self {
        let queue = Arc::new(MessageQueue::new(config.queue.clone()));
        let persistence = PersistenceHandle::spawn(store, config.queue.retry.clone());
        let registry = Arc::new(Registry::new(config.room.clone(), queue, persistence));

        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Default configuration with the in-memory reference store.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Current statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Accept and serve WebSocket connections. Runs until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("coordinator listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let outbox_capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, outbox_capacity).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Serve a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<Registry>,
        stats: Arc<RwLock<ServerStats>>,
        outbox_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        log::info!("WebSocket connection {conn_id} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: owns the per-connection sequence counter, frames and
        // encodes everything the rooms push onto the outbox.
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerMessage>(outbox_capacity);
        let writer = tokio::spawn(async move {
            let mut seq: u64 = 0;
            while let Some(body) = outbox_rx.recv().await {
                seq += 1;
                let frame = ServerFrame { seq, body };
                match frame.encode() {
                    Ok(bytes) => {
                        if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to encode frame for {conn_id}: {e}"),
                }
            }
        });

        let mut joined = false;
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }

                    match ClientMessage::decode(&bytes) {
                        Ok(ClientMessage::Join {
                            room,
                            identity,
                            name,
                        }) if !joined => {
                            match registry
                                .join(conn_id, identity, &name, room, outbox_tx.clone())
                                .await
                            {
                                Ok(()) => joined = true,
                                Err(e) => {
                                    send_failure(&outbox_tx, Uuid::nil(), &e).await;
                                }
                            }
                        }
                        Ok(message) if joined => {
                            if let Err(e) = registry.forward(conn_id, message).await {
                                send_failure(&outbox_tx, Uuid::nil(), &e).await;
                                if matches!(e, CollabError::RoomClosed) {
                                    // Forced rejoin after teardown
                                    break;
                                }
                            }
                        }
                        Ok(_) => {
                            let e = CollabError::Protocol("join must come first".to_string());
                            send_failure(&outbox_tx, Uuid::nil(), &e).await;
                        }
                        Err(e) => {
                            log::warn!("undecodable message from {addr}: {e}");
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    log::info!("connection {conn_id} closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }

        // Cleanup: membership, presence, stats. Queued traffic for the user
        // survives for their next connection.
        registry.leave(conn_id).await;
        drop(outbox_tx);
        let _ = writer.await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::info!("connection {conn_id} cleaned up");

        Ok(())
    }
}

async fn send_failure(outbox: &mpsc::Sender<ServerMessage>, request: Uuid, error: &CollabError) {
    let _ = outbox
        .send(ServerMessage::OperationFailed {
            request,
            code: error.code(),
            reason: error.to_string(),
        })
        .await;
}
