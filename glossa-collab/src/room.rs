//! The room owner task.
//!
//! All state for one collaboration room — membership, the annotation arena,
//! version vector, locks, presence, pending conflicts — is owned by exactly
//! one task. Everything that mutates it arrives as a [`RoomCommand`] on the
//! room's mailbox, so mutations are totally ordered per room while rooms
//! run fully in parallel with no cross-room ordering.
//!
//! ```text
//!  conn task A ──┐
//!  conn task B ──┼── mpsc ──► Room task ── owns ──► SyncEngine
//!  registry   ──┘                │                  PresenceTracker
//!                                │ fan-out (per-member outbox)
//!                                ▼
//!                      conn writer tasks (seq + encode + ws)
//! ```
//!
//! Unreachable members are dropped individually during fan-out; their
//! non-ephemeral traffic is handed to the message queue. An empty room
//! lingers for a grace period to absorb quick rejoins, then the task exits
//! and the registry forgets the handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use glossa_core::{
    ConflictConfig, Resolution, ResolutionAction, ResolutionInput, ResolutionStrategy,
};

use crate::error::CollabError;
use crate::persist::PersistenceHandle;
use crate::presence::{Activity, PresenceConfig, PresenceTracker};
use crate::protocol::{ClientMessage, Identity, MemberInfo, PresenceStatus, ServerMessage};
use crate::queue::{MessageQueue, RetryPolicy};
use crate::sync::{SyncConfig, SyncEngine};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-room tunables.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum simultaneous connections per room.
    pub max_members: usize,
    /// How long an empty room lingers before teardown.
    pub teardown_grace: Duration,
    /// Cadence of the presence/lock/teardown sweep.
    pub tick_interval: Duration,
    /// A connection silent for this long is considered dead.
    pub heartbeat_timeout: Duration,
    /// Minimum interval between cursor rebroadcasts per sender.
    pub cursor_min_interval: Duration,
    pub presence: PresenceConfig,
    pub conflict: ConflictConfig,
    pub sync: SyncConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_members: 100,
            teardown_grace: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(90),
            cursor_min_interval: Duration::from_millis(33),
            presence: PresenceConfig::default(),
            conflict: ConflictConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Connection metadata as the room sees it.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub identity: Identity,
    pub name: String,
    pub connected_at_ms: u64,
}

/// Whether a direct message reached a live connection or the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Queued,
}

/// Commands accepted by a room task.
pub enum RoomCommand {
    Join {
        connection: ConnectionInfo,
        outbox: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<Result<(), CollabError>>,
    },
    Leave {
        connection: Uuid,
    },
    Client {
        connection: Uuid,
        message: ClientMessage,
    },
    DirectMessage {
        user: Uuid,
        message: ServerMessage,
        reply: oneshot::Sender<DeliveryStatus>,
    },
    Broadcast {
        message: ServerMessage,
        exclude: Option<Uuid>,
    },
}

/// Cheap handle for talking to a room task.
#[derive(Clone)]
pub struct RoomHandle {
    pub id: Uuid,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub async fn send(&self, cmd: RoomCommand) -> Result<(), CollabError> {
        self.tx.send(cmd).await.map_err(|_| CollabError::RoomClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the owner task for a new room and return its handle.
pub fn spawn_room(
    id: Uuid,
    cfg: RoomConfig,
    queue: Arc<MessageQueue>,
    persistence: PersistenceHandle,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(256);
    let room = Room {
        id,
        members: HashMap::new(),
        engine: SyncEngine::new(cfg.conflict.clone(), cfg.sync.clone()),
        presence: PresenceTracker::new(),
        queue,
        persistence,
        pending_writes: HashMap::new(),
        empty_since: Some(Instant::now()),
        cfg,
    };
    tokio::spawn(room.run(rx));
    RoomHandle { id, tx }
}

struct Member {
    info: ConnectionInfo,
    outbox: mpsc::Sender<ServerMessage>,
    last_activity: Instant,
    last_cursor_forward: Instant,
}

struct Room {
    id: Uuid,
    cfg: RoomConfig,
    members: HashMap<Uuid, Member>,
    engine: SyncEngine,
    presence: PresenceTracker,
    queue: Arc<MessageQueue>,
    persistence: PersistenceHandle,
    /// Cancellation tokens for in-flight persistence writes, by annotation.
    pending_writes: HashMap<Uuid, CancellationToken>,
    empty_since: Option<Instant>,
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        log::info!("room {} opened", self.id);
        let mut tick = tokio::time::interval(self.cfg.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = tick.tick() => {
                    if self.on_tick().await {
                        break;
                    }
                }
            }
        }

        log::info!("room {} closed", self.id);
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                connection,
                outbox,
                reply,
            } => {
                let result = self.join(connection, outbox).await;
                let _ = reply.send(result);
            }
            RoomCommand::Leave { connection } => {
                self.remove_member(&connection, "leave").await;
            }
            RoomCommand::Client {
                connection,
                message,
            } => {
                self.handle_client(connection, message).await;
            }
            RoomCommand::DirectMessage {
                user,
                message,
                reply,
            } => {
                let status = self.direct_message(user, message).await;
                let _ = reply.send(status);
            }
            RoomCommand::Broadcast { message, exclude } => {
                self.fan_out(message, exclude).await;
            }
        }
    }

    // ── membership ───────────────────────────────────────────────────

    async fn join(
        &mut self,
        connection: ConnectionInfo,
        outbox: mpsc::Sender<ServerMessage>,
    ) -> Result<(), CollabError> {
        if connection.identity.user.is_nil() {
            return Err(CollabError::AccessDenied(
                "identity was not verified".to_string(),
            ));
        }
        if self.members.len() >= self.cfg.max_members {
            return Err(CollabError::CapacityExceeded(format!(
                "room {} is at its member limit",
                self.id
            )));
        }

        let user = connection.identity.user;
        let conn_id = connection.id;
        let now = Instant::now();

        self.members.insert(
            conn_id,
            Member {
                info: connection,
                outbox: outbox.clone(),
                last_activity: now,
                last_cursor_forward: now - self.cfg.cursor_min_interval,
            },
        );
        self.empty_since = None;

        // Presence is rebuilt on reconnect; the first beat is a transition.
        if let Some(record) = self.presence.heartbeat(user, None, now_ms()) {
            self.fan_out(
                ServerMessage::PresenceChanged {
                    user: record.user,
                    status: record.status,
                    activity: record.activity,
                },
                Some(conn_id),
            )
            .await;
        }

        // Snapshot straight to the joiner.
        let snapshot = self.snapshot();
        self.send_to(conn_id, snapshot).await;

        // Replay anything queued while this user was away.
        self.spawn_flush(user, outbox);

        log::info!("user {user} joined room {} (conn {conn_id})", self.id);
        Ok(())
    }

    /// Remove a connection and tell the room the user is gone (when it was
    /// their last connection).
    async fn remove_member(&mut self, connection: &Uuid, why: &str) {
        if let Some(leave_notice) = self.drop_connection(connection, why) {
            self.fan_out(leave_notice, None).await;
        }
    }

    /// Detach a connection from room state. Returns the presence broadcast
    /// the caller owes the room, if any. Never broadcasts itself, so it is
    /// safe to call from inside a fan-out.
    fn drop_connection(&mut self, connection: &Uuid, why: &str) -> Option<ServerMessage> {
        let member = self.members.remove(connection)?;
        let user = member.info.identity.user;
        log::info!(
            "user {user} left room {} (conn {connection}, {why})",
            self.id
        );

        if self.members.is_empty() {
            self.empty_since = Some(Instant::now());
        }

        // Presence goes with the last connection of that user.
        let still_here = self
            .members
            .values()
            .any(|m| m.info.identity.user == user);
        if still_here {
            return None;
        }
        self.presence.remove(&user);
        Some(ServerMessage::PresenceChanged {
            user,
            status: PresenceStatus::Away,
            activity: Activity::Viewing,
        })
    }

    fn snapshot(&self) -> ServerMessage {
        let members = self
            .members
            .values()
            .map(|m| MemberInfo {
                user: m.info.identity.user,
                role: m.info.identity.role,
                name: m.info.name.clone(),
                status: self
                    .presence
                    .get(&m.info.identity.user)
                    .map_or(PresenceStatus::Online, |r| r.status),
            })
            .collect();

        ServerMessage::RoomState {
            room: self.id,
            members,
            annotations: self.engine.annotations().iter().cloned().collect(),
            versions: self.engine.versions().clone(),
            conflicts: self.engine.pending_conflicts(),
        }
    }

    // ── client traffic ───────────────────────────────────────────────

    async fn handle_client(&mut self, connection: Uuid, message: ClientMessage) {
        let Some(member) = self.members.get_mut(&connection) else {
            log::debug!("message from unknown connection {connection}, ignoring");
            return;
        };
        member.last_activity = Instant::now();
        let identity = member.info.identity;

        // Any traffic is a heartbeat; some of it hints at what the user does.
        let hint = activity_hint(&message);
        if let Some(record) = self.presence.heartbeat(identity.user, hint, now_ms()) {
            self.fan_out(
                ServerMessage::PresenceChanged {
                    user: record.user,
                    status: record.status,
                    activity: record.activity,
                },
                None,
            )
            .await;
        }

        match message {
            ClientMessage::Join { .. } => {
                self.fail(connection, Uuid::nil(), CollabError::Protocol(
                    "already joined".to_string(),
                ))
                .await;
            }
            ClientMessage::Leave => {
                self.remove_member(&connection, "leave").await;
            }
            ClientMessage::CreateAnnotation { request, draft } => {
                if !identity.role.can_annotate() {
                    self.fail(
                        connection,
                        request,
                        CollabError::AccessDenied("observers cannot annotate".to_string()),
                    )
                    .await;
                    return;
                }
                match self.engine.create(&draft, identity.user, now_ms()) {
                    Ok((annotation, conflicts)) => {
                        self.persist_upsert(annotation.id);
                        self.fan_out(ServerMessage::AnnotationCreated { annotation }, None)
                            .await;
                        for conflict in conflicts {
                            self.fan_out(ServerMessage::ConflictDetected { conflict }, None)
                                .await;
                        }
                    }
                    Err(e) => self.fail(connection, request, e).await,
                }
            }
            ClientMessage::UpdateAnnotation {
                request,
                annotation,
                patch,
            } => {
                if !identity.role.can_annotate() {
                    self.fail(
                        connection,
                        request,
                        CollabError::AccessDenied("observers cannot annotate".to_string()),
                    )
                    .await;
                    return;
                }
                match self
                    .engine
                    .update(annotation, &patch, identity.user, now_ms(), Instant::now())
                {
                    Ok((annotation, conflicts)) => {
                        self.persist_upsert(annotation.id);
                        self.fan_out(ServerMessage::AnnotationUpdated { annotation }, None)
                            .await;
                        for conflict in conflicts {
                            self.fan_out(ServerMessage::ConflictDetected { conflict }, None)
                                .await;
                        }
                    }
                    Err(e) => self.fail(connection, request, e).await,
                }
            }
            ClientMessage::DeleteAnnotation {
                request,
                annotation,
            } => match self.engine.delete(annotation, &identity, now_ms()) {
                Ok(deleted) => {
                    self.persist_remove(deleted.id);
                    self.fan_out(
                        ServerMessage::AnnotationDeleted {
                            annotation: deleted.id,
                            author: identity.user,
                        },
                        None,
                    )
                    .await;
                }
                Err(e) => self.fail(connection, request, e).await,
            },
            ClientMessage::Lock {
                request,
                annotation,
                ttl_ms,
            } => {
                let ttl = ttl_ms.map(Duration::from_millis);
                if let Err(e) =
                    self.engine
                        .lock(annotation, identity.user, ttl, Instant::now())
                {
                    self.fail(connection, request, e).await;
                }
            }
            ClientMessage::Unlock {
                request,
                annotation,
            } => {
                if let Err(e) = self
                    .engine
                    .unlock(annotation, identity.user, Instant::now())
                {
                    self.fail(connection, request, e).await;
                }
            }
            ClientMessage::CursorUpdate { cursor } => {
                // Ephemeral and high-frequency: rate-limited per sender,
                // never queued, bypasses conflict logic entirely.
                let Some(member) = self.members.get_mut(&connection) else {
                    return;
                };
                if member.last_cursor_forward.elapsed() < self.cfg.cursor_min_interval {
                    return;
                }
                member.last_cursor_forward = Instant::now();
                self.fan_out(
                    ServerMessage::CursorMoved {
                        user: identity.user,
                        cursor,
                    },
                    Some(connection),
                )
                .await;
            }
            ClientMessage::TextOperation {
                request,
                mut op,
                seen_seq,
            } => {
                if !identity.role.can_annotate() {
                    self.fail(
                        connection,
                        request,
                        CollabError::AccessDenied("observers cannot edit".to_string()),
                    )
                    .await;
                    return;
                }
                // The connection's verified identity wins over whatever the
                // payload claims.
                op.author = identity.user;
                match self
                    .engine
                    .apply_operation(op, seen_seq, now_ms(), Instant::now())
                {
                    Ok(Some((seq, op))) => {
                        self.fan_out(ServerMessage::OperationApplied { seq, op }, None)
                            .await;
                    }
                    Ok(None) => {
                        log::debug!("operation from {} fully absorbed", identity.user);
                    }
                    Err(e) => self.fail(connection, request, e).await,
                }
            }
            ClientMessage::ResolveConflict {
                request,
                conflict,
                strategy,
                winner,
            } => {
                let input = match strategy {
                    ResolutionStrategy::ExpertOverride => {
                        let Some(winner) = winner else {
                            self.fail(
                                connection,
                                request,
                                CollabError::Protocol(
                                    "expert override needs a winner".to_string(),
                                ),
                            )
                            .await;
                            return;
                        };
                        ResolutionInput::Override {
                            decider: identity.user,
                            elevated: identity.role.is_elevated(),
                            winner,
                        }
                    }
                    ResolutionStrategy::Vote => {
                        self.fail(
                            connection,
                            request,
                            CollabError::Protocol(
                                "vote resolutions are driven by ballots".to_string(),
                            ),
                        )
                        .await;
                        return;
                    }
                    _ => ResolutionInput::Auto,
                };
                match self.engine.resolve(conflict, strategy, &input, now_ms()) {
                    Ok(resolution) => self.broadcast_resolution(resolution).await,
                    Err(e) => self.fail(connection, request, e).await,
                }
            }
            ClientMessage::Vote { conflict, choice } => {
                let electorate = self.presence.active_count();
                match self
                    .engine
                    .vote(conflict, identity.user, choice, electorate, now_ms())
                {
                    Ok(Some(resolution)) => self.broadcast_resolution(resolution).await,
                    Ok(None) => {}
                    Err(e) => self.fail(connection, Uuid::nil(), e).await,
                }
            }
            ClientMessage::Ack { seq } => {
                log::trace!("conn {connection} acked seq {seq}");
            }
            ClientMessage::Ping => {
                self.send_to(connection, ServerMessage::Pong).await;
            }
        }
    }

    /// Broadcast a resolution plus the annotation state it changed, and
    /// persist the changes.
    async fn broadcast_resolution(&mut self, resolution: Resolution) {
        let mut touched = Vec::new();
        for action in &resolution.actions {
            match action {
                ResolutionAction::Merge {
                    survivor, removed, ..
                } => {
                    touched.push(*survivor);
                    touched.push(*removed);
                }
                ResolutionAction::Keep { removed, .. } => touched.extend(removed.iter().copied()),
                ResolutionAction::Split { left, right } => {
                    touched.push(left.0);
                    touched.push(right.0);
                }
                ResolutionAction::Dismiss => {}
            }
        }

        self.fan_out(ServerMessage::ConflictResolved { resolution }, None)
            .await;

        for id in touched {
            let Some(annotation) = self.engine.annotations().get(&id).cloned() else {
                continue;
            };
            if annotation.is_active() {
                self.persist_upsert(id);
                self.fan_out(ServerMessage::AnnotationUpdated { annotation }, None)
                    .await;
            } else {
                self.persist_remove(id);
                self.fan_out(
                    ServerMessage::AnnotationDeleted {
                        annotation: id,
                        author: annotation.author,
                    },
                    None,
                )
                .await;
            }
        }
    }

    // ── persistence (fire-and-forget, off the hot path) ──────────────

    fn persist_upsert(&mut self, id: Uuid) {
        let Some(annotation) = self.engine.annotations().get(&id).cloned() else {
            return;
        };
        // A newer write supersedes a still-pending older one.
        if let Some(prev) = self.pending_writes.remove(&id) {
            prev.cancel();
        }
        let token = self.persistence.upsert(self.id, annotation);
        self.pending_writes.insert(id, token);
    }

    fn persist_remove(&mut self, id: Uuid) {
        if let Some(prev) = self.pending_writes.remove(&id) {
            prev.cancel();
        }
        let token = self.persistence.remove(self.id, id);
        self.pending_writes.insert(id, token);
    }

    // ── delivery ─────────────────────────────────────────────────────

    async fn fail(&mut self, connection: Uuid, request: Uuid, error: CollabError) {
        log::debug!("request {request} on conn {connection} failed: {error}");
        self.send_to(
            connection,
            ServerMessage::OperationFailed {
                request,
                code: error.code(),
                reason: error.to_string(),
            },
        )
        .await;
    }

    async fn send_to(&mut self, connection: Uuid, message: ServerMessage) {
        let Some(member) = self.members.get(&connection) else {
            return;
        };
        if !self.try_deliver(member, &message) {
            let user = member.info.identity.user;
            if !message.is_ephemeral() {
                self.queue.enqueue(user, message, now_ms()).await;
            }
            self.remove_member(&connection, "unreachable").await;
        }
    }

    /// Best-effort fan-out. No atomicity across recipients: unreachable
    /// members are dropped individually, everyone else still receives it.
    ///
    /// Dropping a member can owe the room a presence broadcast of its own;
    /// those are processed from a worklist rather than recursively.
    async fn fan_out(&mut self, message: ServerMessage, exclude: Option<Uuid>) {
        let mut pending: Vec<(ServerMessage, Option<Uuid>)> = vec![(message, exclude)];

        while let Some((message, exclude)) = pending.pop() {
            let mut dead = Vec::new();
            for (conn_id, member) in &self.members {
                if Some(*conn_id) == exclude {
                    continue;
                }
                if !self.try_deliver(member, &message) {
                    dead.push((*conn_id, member.info.identity.user));
                }
            }

            for (conn_id, user) in dead {
                if !message.is_ephemeral() {
                    self.queue.enqueue(user, message.clone(), now_ms()).await;
                }
                if let Some(leave_notice) = self.drop_connection(&conn_id, "unreachable") {
                    pending.push((leave_notice, None));
                }
            }
        }
    }

    /// Push onto a member's outbox. A full outbox gets a background retry
    /// with backoff (ephemeral messages are simply dropped); a closed one
    /// means the connection is gone.
    fn try_deliver(&self, member: &Member, message: &ServerMessage) -> bool {
        match member.outbox.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                if msg.is_ephemeral() {
                    log::trace!("dropping ephemeral message for slow consumer");
                } else {
                    spawn_send_retry(
                        member.outbox.clone(),
                        msg,
                        self.queue.retry_policy().clone(),
                        self.queue.clone(),
                        member.info.identity.user,
                    );
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn direct_message(&mut self, user: Uuid, message: ServerMessage) -> DeliveryStatus {
        let target = self
            .members
            .iter()
            .find(|(_, m)| m.info.identity.user == user)
            .map(|(id, _)| *id);

        match target {
            Some(conn_id) => {
                self.send_to(conn_id, message).await;
                DeliveryStatus::Delivered
            }
            None => {
                self.queue.enqueue(user, message, now_ms()).await;
                DeliveryStatus::Queued
            }
        }
    }

    fn spawn_flush(&self, user: Uuid, outbox: mpsc::Sender<ServerMessage>) {
        let queue = self.queue.clone();
        let policy = self.queue.retry_policy().clone();

        tokio::spawn(async move {
            let queued = queue.flush(user).await;
            if queued.is_empty() {
                return;
            }
            let count = queued.len();
            log::info!("replaying {count} queued messages for user {user}");

            if outbox
                .send(ServerMessage::QueuedNotification { count })
                .await
                .is_err()
            {
                queue.requeue_front(user, queued).await;
                return;
            }

            let mut iter = queued.into_iter();
            while let Some(mut msg) = iter.next() {
                if outbox.send(msg.payload.clone()).await.is_err() {
                    // Recipient vanished mid-replay: keep the rest for the
                    // next reconnect, dropping anything out of attempts.
                    msg.attempt_count += 1;
                    let rest: Vec<_> = std::iter::once(msg)
                        .chain(iter)
                        .filter(|m| {
                            if policy.exhausted(m.attempt_count) {
                                log::warn!("delivery-failed: dropping message for user {user}");
                                false
                            } else {
                                true
                            }
                        })
                        .collect();
                    queue.requeue_front(user, rest).await;
                    return;
                }
            }
        });
    }

    // ── timers ───────────────────────────────────────────────────────

    /// Periodic sweep. Returns true when the room should tear down.
    async fn on_tick(&mut self) -> bool {
        let now = Instant::now();
        let now_millis = now_ms();

        // Idle/away downgrades
        for record in self.presence.sweep(&self.cfg.presence, now_millis) {
            self.fan_out(
                ServerMessage::PresenceChanged {
                    user: record.user,
                    status: record.status,
                    activity: record.activity,
                },
                None,
            )
            .await;
        }

        // Expired locks simply vanish; the next touch re-acquires.
        let freed = self.engine.sweep_locks(now);
        if !freed.is_empty() {
            log::debug!("room {}: {} locks expired", self.id, freed.len());
        }

        // Dead connections (no traffic within the heartbeat timeout)
        let dead: Vec<Uuid> = self
            .members
            .iter()
            .filter(|(_, m)| m.last_activity.elapsed() > self.cfg.heartbeat_timeout)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in dead {
            self.remove_member(&conn_id, "heartbeat timeout").await;
        }

        // Deferred teardown after the grace period
        matches!(self.empty_since, Some(t) if t.elapsed() >= self.cfg.teardown_grace)
    }
}

/// Map client traffic to a presence activity hint.
fn activity_hint(message: &ClientMessage) -> Option<Activity> {
    match message {
        ClientMessage::CursorUpdate { .. } => Some(Activity::Viewing),
        ClientMessage::UpdateAnnotation { annotation, .. }
        | ClientMessage::Lock { annotation, .. } => Some(Activity::Annotating(*annotation)),
        ClientMessage::Vote { .. } | ClientMessage::ResolveConflict { .. } => {
            Some(Activity::Discussing)
        }
        _ => None,
    }
}

/// Retry a full outbox in the background with exponential backoff; if the
/// recipient stays unreachable the message falls back to its queue.
fn spawn_send_retry(
    outbox: mpsc::Sender<ServerMessage>,
    message: ServerMessage,
    policy: RetryPolicy,
    queue: Arc<MessageQueue>,
    user: Uuid,
) {
    tokio::spawn(async move {
        let mut attempt = 0;
        loop {
            tokio::time::sleep(policy.delay_for(attempt)).await;
            match outbox.try_send(message.clone()) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    attempt += 1;
                    if policy.exhausted(attempt) {
                        log::warn!("delivery-failed: user {user} outbox stayed full");
                        queue.enqueue(user, message, now_ms()).await;
                        return;
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    queue.enqueue(user, message, now_ms()).await;
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryStore, PersistenceHandle};
    use crate::protocol::Role;
    use crate::queue::QueueConfig;
    use glossa_core::AnnotationDraft;

    fn test_room(cfg: RoomConfig) -> (RoomHandle, Arc<MessageQueue>, Arc<MemoryStore>) {
        let queue = Arc::new(MessageQueue::new(QueueConfig::default()));
        let store = Arc::new(MemoryStore::new());
        let persistence = PersistenceHandle::spawn(store.clone(), RetryPolicy::default());
        let handle = spawn_room(Uuid::new_v4(), cfg, queue.clone(), persistence);
        (handle, queue, store)
    }

    fn identity(n: u128) -> Identity {
        Identity {
            user: Uuid::from_u128(n),
            role: Role::Annotator,
        }
    }

    async fn join(
        handle: &RoomHandle,
        ident: Identity,
        name: &str,
    ) -> (Uuid, mpsc::Receiver<ServerMessage>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(RoomCommand::Join {
                connection: ConnectionInfo {
                    id: conn_id,
                    identity: ident,
                    name: name.to_string(),
                    connected_at_ms: now_ms(),
                },
                outbox: tx,
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap().unwrap();
        (conn_id, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_join_receives_snapshot() {
        let (handle, _, _) = test_room(RoomConfig::default());
        let (_conn, mut rx) = join(&handle, identity(1), "Alice").await;

        match next_message(&mut rx).await {
            ServerMessage::RoomState {
                members,
                annotations,
                ..
            } => {
                assert_eq!(members.len(), 1);
                assert!(annotations.is_empty());
            }
            other => panic!("expected RoomState, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_broadcasts_to_everyone() {
        let (handle, _, store) = test_room(RoomConfig::default());
        let (conn_a, mut rx_a) = join(&handle, identity(1), "Alice").await;
        let (_conn_b, mut rx_b) = join(&handle, identity(2), "Bob").await;

        // Drain join-time traffic
        let _ = next_message(&mut rx_a).await; // RoomState
        let _ = next_message(&mut rx_a).await; // Bob's presence
        let _ = next_message(&mut rx_b).await; // RoomState

        handle
            .send(RoomCommand::Client {
                connection: conn_a,
                message: ClientMessage::CreateAnnotation {
                    request: Uuid::new_v4(),
                    draft: AnnotationDraft::new(10, 20, vec!["PERSON".to_string()]),
                },
            })
            .await
            .unwrap();

        let to_author = next_message(&mut rx_a).await;
        let to_peer = next_message(&mut rx_b).await;
        let annotation = match (&to_author, &to_peer) {
            (
                ServerMessage::AnnotationCreated { annotation: a },
                ServerMessage::AnnotationCreated { annotation: b },
            ) => {
                assert_eq!(a, b);
                a.clone()
            }
            other => panic!("expected AnnotationCreated pair, got {other:?}"),
        };
        assert_eq!(annotation.version, 1);

        // Persistence lands asynchronously, never blocking the broadcast
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_observer_cannot_annotate() {
        let (handle, _, _) = test_room(RoomConfig::default());
        let observer = Identity {
            user: Uuid::from_u128(5),
            role: Role::Observer,
        };
        let (conn, mut rx) = join(&handle, observer, "Watcher").await;
        let _ = next_message(&mut rx).await; // RoomState

        handle
            .send(RoomCommand::Client {
                connection: conn,
                message: ClientMessage::CreateAnnotation {
                    request: Uuid::new_v4(),
                    draft: AnnotationDraft::new(10, 20, vec!["PERSON".to_string()]),
                },
            })
            .await
            .unwrap();

        match next_message(&mut rx).await {
            ServerMessage::OperationFailed { code, .. } => {
                assert_eq!(code, crate::error::ErrorCode::AccessDenied);
            }
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_direct_message_queues_for_offline_user() {
        let (handle, queue, _) = test_room(RoomConfig::default());
        let offline = Uuid::from_u128(42);

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(RoomCommand::DirectMessage {
                user: offline,
                message: ServerMessage::QueuedNotification { count: 0 },
                reply: reply_tx,
            })
            .await
            .unwrap();

        assert_eq!(reply_rx.await.unwrap(), DeliveryStatus::Queued);
        assert_eq!(queue.len(offline).await, 1);
    }

    #[tokio::test]
    async fn test_room_tears_down_after_grace() {
        let cfg = RoomConfig {
            teardown_grace: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
            ..RoomConfig::default()
        };
        let (handle, _, _) = test_room(cfg);
        let (conn, mut rx) = join(&handle, identity(1), "Alice").await;
        let _ = next_message(&mut rx).await;

        handle
            .send(RoomCommand::Leave { connection: conn })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_quick_rejoin_cancels_teardown() {
        let cfg = RoomConfig {
            teardown_grace: Duration::from_millis(150),
            tick_interval: Duration::from_millis(10),
            ..RoomConfig::default()
        };
        let (handle, _, _) = test_room(cfg);
        let (conn, _rx) = join(&handle, identity(1), "Alice").await;
        handle
            .send(RoomCommand::Leave { connection: conn })
            .await
            .unwrap();

        // Rejoin within the grace period
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_conn2, _rx2) = join(&handle, identity(1), "Alice").await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let cfg = RoomConfig {
            max_members: 1,
            ..RoomConfig::default()
        };
        let (handle, _, _) = test_room(cfg);
        let (_conn, _rx) = join(&handle, identity(1), "Alice").await;

        let (tx, _rx2) = mpsc::channel(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(RoomCommand::Join {
                connection: ConnectionInfo {
                    id: Uuid::new_v4(),
                    identity: identity(2),
                    name: "Bob".to_string(),
                    connected_at_ms: now_ms(),
                },
                outbox: tx,
                reply: reply_tx,
            })
            .await
            .unwrap();

        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, CollabError::CapacityExceeded(_)));
    }
}
