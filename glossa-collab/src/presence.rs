//! Per-room presence: who is here, how awake they are, what they're doing.
//!
//! Status transitions are driven by activity heartbeats and by the room's
//! periodic sweep:
//!
//! ```text
//!           heartbeat                heartbeat
//!         ┌───────────┐            ┌───────────┐
//!         ▼           │            ▼           │
//!      Online ──60s──► Idle ──5min──► Away ────┘
//! ```
//!
//! `presence-changed` is broadcast only when a heartbeat or sweep actually
//! changes the status or activity, never per heartbeat, which bounds
//! broadcast volume. Presence is transient: it is rebuilt from scratch on
//! reconnect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness of a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Idle,
    Away,
}

/// What the member is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Viewing,
    /// Actively editing the given annotation.
    Annotating(Uuid),
    Discussing,
}

/// Inactivity thresholds.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub idle_after_ms: u64,
    pub away_after_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_after_ms: 60_000,
            away_after_ms: 300_000,
        }
    }
}

/// One member's presence state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user: Uuid,
    pub status: PresenceStatus,
    pub activity: Activity,
    pub last_heartbeat_ms: u64,
}

/// Tracks presence for every member of one room.
///
/// Owned and mutated only by the room owner task.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: HashMap<Uuid, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity from `user`.
    ///
    /// Returns the updated record only when the status or activity actually
    /// changed — the caller broadcasts exactly those.
    pub fn heartbeat(
        &mut self,
        user: Uuid,
        activity: Option<Activity>,
        now_ms: u64,
    ) -> Option<PresenceRecord> {
        let record = self.records.entry(user).or_insert(PresenceRecord {
            user,
            status: PresenceStatus::Away, // forces a transition on first beat
            activity: Activity::Viewing,
            last_heartbeat_ms: 0,
        });

        let old_status = record.status;
        let old_activity = record.activity;

        record.last_heartbeat_ms = now_ms;
        record.status = PresenceStatus::Online;
        if let Some(activity) = activity {
            record.activity = activity;
        }

        (record.status != old_status || record.activity != old_activity).then(|| record.clone())
    }

    /// Downgrade silent members. Idempotent; returns the transitions.
    pub fn sweep(&mut self, cfg: &PresenceConfig, now_ms: u64) -> Vec<PresenceRecord> {
        let mut changed = Vec::new();
        for record in self.records.values_mut() {
            let silent = now_ms.saturating_sub(record.last_heartbeat_ms);
            let target = if silent >= cfg.away_after_ms {
                PresenceStatus::Away
            } else if silent >= cfg.idle_after_ms {
                PresenceStatus::Idle
            } else {
                PresenceStatus::Online
            };
            if record.status != target {
                record.status = target;
                changed.push(record.clone());
            }
        }
        changed.sort_by_key(|r| r.user);
        changed
    }

    pub fn remove(&mut self, user: &Uuid) -> Option<PresenceRecord> {
        self.records.remove(user)
    }

    pub fn get(&self, user: &Uuid) -> Option<&PresenceRecord> {
        self.records.get(user)
    }

    /// Members currently not `Away`, the electorate for conflict votes.
    pub fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status != PresenceStatus::Away)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
