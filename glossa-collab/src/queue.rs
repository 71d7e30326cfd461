//! Bounded per-recipient message queues for offline or unreachable users.
//!
//! Two priority tiers, FIFO within each: `Critical` (conflicts, failures)
//! always drains before `Normal` (annotation traffic). Ephemeral messages
//! (cursor movement, pongs) are never queued — an offline recipient simply
//! misses them. A newer queued update for an annotation supersedes an older
//! one, and capacity overflow evicts oldest-first, normal tier first.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Delivery priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical,
    Normal,
}

/// Classify a message into its delivery tier.
pub fn priority_of(msg: &ServerMessage) -> Priority {
    match msg {
        ServerMessage::ConflictDetected { .. }
        | ServerMessage::ConflictResolved { .. }
        | ServerMessage::OperationFailed { .. } => Priority::Critical,
        _ => Priority::Normal,
    }
}

/// The annotation a queued message would be superseded by, if any.
///
/// A later create/update/delete for the same annotation replaces an older
/// queued one — the payloads carry full state, so nothing is lost.
pub fn supersede_key(msg: &ServerMessage) -> Option<Uuid> {
    match msg {
        ServerMessage::AnnotationCreated { annotation }
        | ServerMessage::AnnotationUpdated { annotation } => Some(annotation.id),
        ServerMessage::AnnotationDeleted { annotation, .. } => Some(*annotation),
        _ => None,
    }
}

/// Queue limits and the delivery retry policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued messages per recipient, both tiers combined.
    pub capacity_per_user: usize,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity_per_user: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff for transient delivery failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given (0-based) retry attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// A queued message awaiting delivery.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: ServerMessage,
    pub priority: Priority,
    pub enqueued_at_ms: u64,
    pub attempt_count: u32,
}

/// One recipient's bounded two-tier queue.
#[derive(Debug, Default)]
struct UserQueue {
    critical: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
}

impl UserQueue {
    fn len(&self) -> usize {
        self.critical.len() + self.normal.len()
    }

    /// Push a message, applying supersession and capacity eviction.
    /// Returns the number of evicted messages.
    fn push(&mut self, msg: QueuedMessage, capacity: usize) -> usize {
        if let Some(key) = supersede_key(&msg.payload) {
            let stale =
                |m: &QueuedMessage| supersede_key(&m.payload) == Some(key);
            self.critical.retain(|m| !stale(m));
            self.normal.retain(|m| !stale(m));
        }

        let mut evicted = 0;
        while self.len() >= capacity {
            // Oldest first; the normal tier gives way before critical.
            if self.normal.pop_front().is_some() || self.critical.pop_front().is_some() {
                evicted += 1;
            } else {
                break;
            }
        }

        match msg.priority {
            Priority::Critical => self.critical.push_back(msg),
            Priority::Normal => self.normal.push_back(msg),
        }
        evicted
    }

    /// Drain for delivery: critical tier first, FIFO within each tier.
    fn drain(&mut self) -> Vec<QueuedMessage> {
        self.critical
            .drain(..)
            .chain(self.normal.drain(..))
            .collect()
    }
}

/// Per-recipient queues for the whole deployment instance.
///
/// Each user's queue is mutated only through this manager; the lock is held
/// for map operations only, never across sends.
pub struct MessageQueue {
    queues: Mutex<HashMap<Uuid, UserQueue>>,
    cfg: QueueConfig,
}

impl MessageQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            cfg,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.cfg.retry
    }

    /// Queue a message for an unreachable recipient.
    ///
    /// Ephemeral messages are dropped; returns whether anything was queued.
    pub async fn enqueue(&self, recipient: Uuid, payload: ServerMessage, now_ms: u64) -> bool {
        if payload.is_ephemeral() {
            log::trace!("dropping ephemeral message for offline user {recipient}");
            return false;
        }

        let msg = QueuedMessage {
            priority: priority_of(&payload),
            payload,
            enqueued_at_ms: now_ms,
            attempt_count: 0,
        };

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(recipient).or_default();
        let evicted = queue.push(msg, self.cfg.capacity_per_user);
        if evicted > 0 {
            log::warn!("queue overflow for user {recipient}: evicted {evicted} oldest");
        }
        true
    }

    /// Take everything queued for `recipient`, in delivery order.
    pub async fn flush(&self, recipient: Uuid) -> Vec<QueuedMessage> {
        let mut queues = self.queues.lock().await;
        match queues.remove(&recipient) {
            Some(mut queue) => queue.drain(),
            None => Vec::new(),
        }
    }

    /// Put back messages from a delivery that failed partway, preserving
    /// their order ahead of anything queued meanwhile.
    pub async fn requeue_front(&self, recipient: Uuid, messages: Vec<QueuedMessage>) {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(recipient).or_default();
        for msg in messages.into_iter().rev() {
            match msg.priority {
                Priority::Critical => queue.critical.push_front(msg),
                Priority::Normal => queue.normal.push_front(msg),
            }
        }
    }

    pub async fn len(&self, recipient: Uuid) -> usize {
        self.queues
            .lock()
            .await
            .get(&recipient)
            .map_or(0, UserQueue::len)
    }
}
