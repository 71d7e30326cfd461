//! Connection/room registry: routing, not room state.
//!
//! The registry maps room ids to the mailboxes of their owner tasks and
//! connections to the room they joined. Room state itself lives inside the
//! room tasks; the registry never touches it, it only routes commands. When
//! a room task ends (teardown after its grace period) its handle reports
//! closed and is replaced on the next join.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::error::CollabError;
use crate::persist::PersistenceHandle;
use crate::protocol::{ClientMessage, Identity, ServerMessage};
use crate::queue::MessageQueue;
use crate::room::{
    now_ms, spawn_room, ConnectionInfo, DeliveryStatus, RoomCommand, RoomConfig, RoomHandle,
};

pub struct Registry {
    rooms: RwLock<HashMap<Uuid, RoomHandle>>,
    /// connection id → room id, maintained at join/leave.
    connections: RwLock<HashMap<Uuid, Uuid>>,
    cfg: RoomConfig,
    queue: Arc<MessageQueue>,
    persistence: PersistenceHandle,
}

impl Registry {
    pub fn new(cfg: RoomConfig, queue: Arc<MessageQueue>, persistence: PersistenceHandle) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            cfg,
            queue,
            persistence,
        }
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Join a verified identity into a room, creating the room on first use.
    ///
    /// On success the caller's outbox starts receiving room traffic,
    /// beginning with the `RoomState` snapshot.
    pub async fn join(
        &self,
        connection_id: Uuid,
        identity: Identity,
        name: &str,
        room_id: Uuid,
        outbox: mpsc::Sender<ServerMessage>,
    ) -> Result<(), CollabError> {
        let room = self.get_or_create(room_id).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        room.send(RoomCommand::Join {
            connection: ConnectionInfo {
                id: connection_id,
                identity,
                name: name.to_string(),
                connected_at_ms: now_ms(),
            },
            outbox,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| CollabError::RoomClosed)??;

        self.connections
            .write()
            .await
            .insert(connection_id, room_id);
        Ok(())
    }

    /// Remove a connection from its room (disconnect or explicit leave).
    pub async fn leave(&self, connection_id: Uuid) {
        let room_id = self.connections.write().await.remove(&connection_id);
        let Some(room_id) = room_id else {
            return;
        };
        if let Some(room) = self.lookup(room_id).await {
            let _ = room
                .send(RoomCommand::Leave {
                    connection: connection_id,
                })
                .await;
        }
    }

    /// Route a client message to the room its connection joined.
    pub async fn forward(
        &self,
        connection_id: Uuid,
        message: ClientMessage,
    ) -> Result<(), CollabError> {
        let room_id = self
            .connections
            .read()
            .await
            .get(&connection_id)
            .copied()
            .ok_or_else(|| CollabError::Protocol("not in a room; join first".to_string()))?;

        let room = self.lookup(room_id).await.ok_or(CollabError::RoomClosed)?;
        room.send(RoomCommand::Client {
            connection: connection_id,
            message,
        })
        .await
    }

    /// Best-effort fan-out to a whole room.
    pub async fn broadcast(
        &self,
        room_id: Uuid,
        message: ServerMessage,
        exclude: Option<Uuid>,
    ) -> Result<(), CollabError> {
        let room = self.lookup(room_id).await.ok_or(CollabError::RoomClosed)?;
        room.send(RoomCommand::Broadcast { message, exclude }).await
    }

    /// Deliver to one user: immediately when connected, else via the queue.
    pub async fn direct_message(
        &self,
        user: Uuid,
        room_id: Uuid,
        message: ServerMessage,
    ) -> DeliveryStatus {
        if let Some(room) = self.lookup(room_id).await {
            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = room
                .send(RoomCommand::DirectMessage {
                    user,
                    message: message.clone(),
                    reply: reply_tx,
                })
                .await;
            if sent.is_ok() {
                if let Ok(status) = reply_rx.await {
                    return status;
                }
            }
        }

        self.queue.enqueue(user, message, now_ms()).await;
        DeliveryStatus::Queued
    }

    /// Rooms whose owner task is still alive.
    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn lookup(&self, room_id: Uuid) -> Option<RoomHandle> {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Get the live handle for a room, spawning a fresh owner task when the
    /// room is new or its previous task already tore down.
    async fn get_or_create(&self, room_id: Uuid) -> RoomHandle {
        // Fast path: read lock
        if let Some(room) = self.lookup(room_id).await {
            return room;
        }

        // Slow path: write lock, re-check, replace dead handles
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&room_id) {
            if !room.is_closed() {
                return room.clone();
            }
            log::debug!("room {room_id} handle was dead, respawning");
        }

        let handle = spawn_room(
            room_id,
            self.cfg.clone(),
            self.queue.clone(),
            self.persistence.clone(),
        );
        rooms.insert(room_id, handle.clone());
        handle
    }
}
