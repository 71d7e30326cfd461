//! Annotation synchronization engine: the state a room owner task owns.
//!
//! One engine instance per room, touched only by that room's task, which is
//! what makes the transform convergence invariant tractable: every mutation
//! is totally ordered here, and the order is the canonical one.
//!
//! Responsibilities:
//! - versioned create/update/delete with optimistic accept
//! - edit locks with TTL expiry (swept by the room tick, checked lazily too)
//! - server-side transformation of span operations against the op log
//! - conflict bookkeeping: pending conflicts, ballots, resolutions

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use uuid::Uuid;

use glossa_core::{
    detect, transform, Annotation, AnnotationDraft, AnnotationPatch, AnnotationSet,
    AnnotationStatus, Candidate, Conflict, ConflictConfig, ConflictStatus, OpKind, Operation,
    RecentEdit, Resolution, ResolutionAction, ResolutionInput, ResolutionStrategy, ResolveError,
    Resolver, ValidationError, VersionVector,
};

use crate::error::CollabError;
use crate::protocol::Identity;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Lock lifetime when the client does not ask for one.
    pub default_lock_ttl: Duration,
    /// How far back the recent-edit window reaches.
    pub recent_edit_window_ms: u64,
    /// Transformed operations retained for late arrivals.
    pub op_log_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_lock_ttl: Duration::from_secs(30),
            recent_edit_window_ms: 30_000,
            op_log_limit: 256,
        }
    }
}

/// A live edit lock.
#[derive(Debug, Clone, Copy)]
pub struct LockInfo {
    pub author: Uuid,
    pub expires_at: Instant,
}

/// Per-room synchronization state.
pub struct SyncEngine {
    annotations: AnnotationSet,
    versions: VersionVector,
    locks: HashMap<Uuid, LockInfo>,
    recent_edits: VecDeque<RecentEdit>,
    conflicts: BTreeMap<Uuid, Conflict>,
    ballots: HashMap<Uuid, BTreeMap<Uuid, Uuid>>,
    op_log: VecDeque<(u64, Operation)>,
    op_seq: u64,
    /// Last stamped op timestamp per author; keeps the tie-break order total.
    last_op_ts: HashMap<Uuid, u64>,
    conflict_cfg: ConflictConfig,
    resolver: Resolver,
    cfg: SyncConfig,
}

impl SyncEngine {
    pub fn new(conflict_cfg: ConflictConfig, cfg: SyncConfig) -> Self {
        Self {
            annotations: AnnotationSet::new(),
            versions: VersionVector::new(),
            locks: HashMap::new(),
            recent_edits: VecDeque::new(),
            conflicts: BTreeMap::new(),
            ballots: HashMap::new(),
            op_log: VecDeque::new(),
            op_seq: 0,
            last_op_ts: HashMap::new(),
            conflict_cfg: conflict_cfg.clone(),
            resolver: Resolver::new(conflict_cfg),
            cfg,
        }
    }

    pub fn annotations(&self) -> &AnnotationSet {
        &self.annotations
    }

    pub fn versions(&self) -> &VersionVector {
        &self.versions
    }

    pub fn op_seq(&self) -> u64 {
        self.op_seq
    }

    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        self.conflicts
            .values()
            .filter(|c| c.status == ConflictStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn conflict(&self, id: &Uuid) -> Option<&Conflict> {
        self.conflicts.get(id)
    }

    // ── annotation CRUD ──────────────────────────────────────────────

    /// Accept a new annotation: validate, assign id and version, detect
    /// conflicts. The annotation is live in the arena before persistence is
    /// even attempted.
    pub fn create(
        &mut self,
        draft: &AnnotationDraft,
        author: Uuid,
        now_ms: u64,
    ) -> Result<(Annotation, Vec<Conflict>), CollabError> {
        let span = draft.validate()?;
        let id = Uuid::new_v4();

        let candidate = Candidate {
            annotation: Some(id),
            span,
            labels: draft.labels.clone(),
            author,
            at_ms: now_ms,
        };
        let conflicts = self.detect_and_record(&candidate, now_ms);

        let annotation = Annotation {
            id,
            span,
            labels: draft.labels.clone(),
            author,
            version: self.issue_version(author, 0),
            status: AnnotationStatus::Active,
            modified_at_ms: now_ms,
        };
        self.annotations.insert(annotation.clone());

        Ok((annotation, conflicts))
    }

    /// Apply a patch: lock and base-version guarded, conflict-checked.
    pub fn update(
        &mut self,
        id: Uuid,
        patch: &AnnotationPatch,
        author: Uuid,
        now_ms: u64,
        now: Instant,
    ) -> Result<(Annotation, Vec<Conflict>), CollabError> {
        patch.validate()?;
        self.check_lock(id, author, now)?;

        let current = self
            .annotations
            .get(&id)
            .filter(|a| a.is_active())
            .cloned()
            .ok_or(CollabError::UnknownAnnotation(id))?;

        if patch.base_version < current.version {
            return Err(CollabError::VersionConflict {
                annotation: id,
                base: patch.base_version,
                current: current.version,
            });
        }

        let candidate = Candidate {
            annotation: Some(id),
            span: patch.span.unwrap_or(current.span),
            labels: patch.labels.clone().unwrap_or_else(|| current.labels.clone()),
            author,
            at_ms: now_ms,
        };
        let conflicts = self.detect_and_record(&candidate, now_ms);

        let version = self.issue_version(author, current.version);
        let ann = self
            .annotations
            .get_mut(&id)
            .ok_or(CollabError::UnknownAnnotation(id))?;
        if let Some(span) = patch.span {
            ann.span = span;
        }
        if let Some(labels) = &patch.labels {
            ann.labels = labels.clone();
        }
        ann.version = version;
        ann.modified_at_ms = now_ms;
        let updated = ann.clone();

        self.record_edit(id, author, now_ms);
        Ok((updated, conflicts))
    }

    /// Soft delete. Author or an elevated role only.
    pub fn delete(
        &mut self,
        id: Uuid,
        identity: &Identity,
        now_ms: u64,
    ) -> Result<Annotation, CollabError> {
        let current = self
            .annotations
            .get(&id)
            .filter(|a| a.is_active())
            .cloned()
            .ok_or(CollabError::UnknownAnnotation(id))?;

        if current.author != identity.user && !identity.role.is_elevated() {
            return Err(CollabError::AccessDenied(
                "only the author or an elevated role may delete".to_string(),
            ));
        }

        let version = self.issue_version(identity.user, current.version);
        let ann = self
            .annotations
            .get_mut(&id)
            .ok_or(CollabError::UnknownAnnotation(id))?;
        ann.status = AnnotationStatus::Deleted;
        ann.version = version;
        ann.modified_at_ms = now_ms;
        let deleted = ann.clone();

        // A tombstone cannot stay locked.
        self.locks.remove(&id);
        self.record_edit(id, identity.user, now_ms);
        Ok(deleted)
    }

    // ── locks ────────────────────────────────────────────────────────

    /// Acquire or refresh an edit lock. Expires after `ttl` so a vanished
    /// holder cannot deadlock the annotation.
    pub fn lock(
        &mut self,
        id: Uuid,
        author: Uuid,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<Instant, CollabError> {
        if self.annotations.get(&id).filter(|a| a.is_active()).is_none() {
            return Err(CollabError::UnknownAnnotation(id));
        }
        self.check_lock(id, author, now)?;

        let expires_at = now + ttl.unwrap_or(self.cfg.default_lock_ttl);
        self.locks.insert(id, LockInfo { author, expires_at });
        Ok(expires_at)
    }

    /// Release a lock held by `author`. Releasing a lock that is absent or
    /// already expired is a no-op.
    pub fn unlock(&mut self, id: Uuid, author: Uuid, now: Instant) -> Result<(), CollabError> {
        match self.locks.get(&id) {
            Some(lock) if lock.expires_at > now && lock.author != author => {
                Err(CollabError::LockConflict { annotation: id })
            }
            Some(_) => {
                self.locks.remove(&id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// The current non-expired lock holder, if any.
    pub fn lock_holder(&self, id: &Uuid, now: Instant) -> Option<Uuid> {
        self.locks
            .get(id)
            .filter(|l| l.expires_at > now)
            .map(|l| l.author)
    }

    /// Drop expired locks. Idempotent; returns the freed annotation ids.
    pub fn sweep_locks(&mut self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .locks
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.locks.remove(id);
        }
        expired
    }

    fn check_lock(&self, id: Uuid, author: Uuid, now: Instant) -> Result<(), CollabError> {
        match self.lock_holder(&id, now) {
            Some(holder) if holder != author => Err(CollabError::LockConflict { annotation: id }),
            _ => Ok(()),
        }
    }

    // ── span operations ──────────────────────────────────────────────

    /// Transform an incoming operation against everything applied since the
    /// client's `seen_seq`, then apply it.
    ///
    /// Returns `None` when the operation was fully absorbed by concurrent
    /// work. The returned sequence number is the one broadcast to the room.
    pub fn apply_operation(
        &mut self,
        mut op: Operation,
        seen_seq: u64,
        now_ms: u64,
        now: Instant,
    ) -> Result<Option<(u64, Operation)>, CollabError> {
        self.validate_op(&op, now)?;

        if seen_seq > self.op_seq {
            return Err(CollabError::Protocol(format!(
                "baseline {seen_seq} is ahead of the room (at {})",
                self.op_seq
            )));
        }
        if let Some((oldest, _)) = self.op_log.front() {
            if seen_seq + 1 < *oldest {
                return Err(CollabError::Protocol(
                    "operation baseline predates the retained op log".to_string(),
                ));
            }
        } else if seen_seq < self.op_seq {
            return Err(CollabError::Protocol(
                "operation baseline predates the retained op log".to_string(),
            ));
        }

        // Stamp a per-author strictly monotonic timestamp so the
        // `(timestamp, author)` tie-break is a total order.
        let stamped = {
            let last = self.last_op_ts.entry(op.author).or_insert(0);
            let ts = op.issued_at_ms.max(*last + 1);
            *last = ts;
            ts
        };
        op.issued_at_ms = stamped;

        // Reconcile against ops the client had not seen.
        for (seq, applied) in self.op_log.iter() {
            if *seq <= seen_seq {
                continue;
            }
            match transform(op, applied) {
                Some(adjusted) => op = adjusted,
                None => return Ok(None),
            }
        }

        self.op_seq += 1;
        let seq = self.op_seq;
        self.annotations.apply(&op);

        // Span moves and relabels are edits of their target.
        if let Some(target) = op.target() {
            if let Some(floor) = self.annotations.get(&target).map(|a| a.version) {
                let version = self.issue_version(op.author, floor);
                if let Some(ann) = self.annotations.get_mut(&target) {
                    ann.version = version;
                    ann.modified_at_ms = now_ms;
                }
            }
            self.record_edit(target, op.author, now_ms);
        }

        self.op_log.push_back((seq, op.clone()));
        while self.op_log.len() > self.cfg.op_log_limit {
            self.op_log.pop_front();
        }

        Ok(Some((seq, op)))
    }

    fn validate_op(&self, op: &Operation, now: Instant) -> Result<(), CollabError> {
        match &op.kind {
            OpKind::InsertText { len, .. } if *len == 0 => {
                Err(ValidationError::EmptyOperation.into())
            }
            OpKind::Relabel { labels, .. } if labels.is_empty() => {
                Err(ValidationError::NoLabels.into())
            }
            OpKind::MoveSpan { target, .. } | OpKind::Relabel { target, .. } => {
                if self
                    .annotations
                    .get(target)
                    .filter(|a| a.is_active())
                    .is_none()
                {
                    return Err(CollabError::UnknownAnnotation(*target));
                }
                self.check_lock(*target, op.author, now)
            }
            _ => Ok(()),
        }
    }

    // ── conflicts ────────────────────────────────────────────────────

    /// Run a resolution strategy and apply its arena changes.
    pub fn resolve(
        &mut self,
        conflict_id: Uuid,
        strategy: ResolutionStrategy,
        input: &ResolutionInput,
        now_ms: u64,
    ) -> Result<Resolution, CollabError> {
        let conflict = self
            .conflicts
            .get(&conflict_id)
            .ok_or(CollabError::UnknownConflict(conflict_id))?;

        let resolution = self
            .resolver
            .resolve(conflict, strategy, input, &self.annotations)?;

        self.apply_resolution(&resolution, now_ms);
        Ok(resolution)
    }

    /// Record a ballot; resolves the conflict once quorum is reached.
    pub fn vote(
        &mut self,
        conflict_id: Uuid,
        voter: Uuid,
        choice: Uuid,
        active_participants: usize,
        now_ms: u64,
    ) -> Result<Option<Resolution>, CollabError> {
        if !self.conflicts.contains_key(&conflict_id) {
            return Err(CollabError::UnknownConflict(conflict_id));
        }

        let ballots = self.ballots.entry(conflict_id).or_default();
        ballots.insert(voter, choice);
        let input = ResolutionInput::Votes {
            ballots: ballots.clone(),
            active_participants,
        };

        match self.resolve(conflict_id, ResolutionStrategy::Vote, &input, now_ms) {
            Ok(resolution) => Ok(Some(resolution)),
            Err(CollabError::Resolution(ResolveError::QuorumNotReached { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Dismiss a pending conflict without touching the arena.
    pub fn dismiss(&mut self, conflict_id: Uuid) -> Result<Resolution, CollabError> {
        let conflict = self
            .conflicts
            .get(&conflict_id)
            .ok_or(CollabError::UnknownConflict(conflict_id))?;
        let resolution = self.resolver.dismiss(conflict)?;

        if let Some(c) = self.conflicts.get_mut(&conflict_id) {
            c.status = ConflictStatus::Dismissed;
        }
        self.ballots.remove(&conflict_id);
        Ok(resolution)
    }

    fn apply_resolution(&mut self, resolution: &Resolution, now_ms: u64) {
        for action in &resolution.actions {
            match action {
                ResolutionAction::Merge {
                    survivor,
                    removed,
                    span,
                } => {
                    self.respan(*survivor, *span, now_ms);
                    self.tombstone(*removed, now_ms);
                }
                ResolutionAction::Keep { removed, .. } => {
                    for id in removed {
                        self.tombstone(*id, now_ms);
                    }
                }
                ResolutionAction::Split { left, right } => {
                    self.respan(left.0, left.1, now_ms);
                    self.respan(right.0, right.1, now_ms);
                }
                ResolutionAction::Dismiss => {}
            }
        }

        if let Some(c) = self.conflicts.get_mut(&resolution.conflict) {
            c.status = match resolution.actions.as_slice() {
                [ResolutionAction::Dismiss] => ConflictStatus::Dismissed,
                _ => ConflictStatus::Resolved,
            };
        }
        self.ballots.remove(&resolution.conflict);
    }

    fn respan(&mut self, id: Uuid, span: glossa_core::Span, now_ms: u64) {
        let Some(floor) = self.annotations.get(&id).map(|a| a.version) else {
            return;
        };
        let Some(author) = self.annotations.get(&id).map(|a| a.author) else {
            return;
        };
        let version = self.issue_version(author, floor);
        if let Some(ann) = self.annotations.get_mut(&id) {
            ann.span = span;
            ann.version = version;
            ann.modified_at_ms = now_ms;
        }
    }

    fn tombstone(&mut self, id: Uuid, now_ms: u64) {
        let Some((floor, author)) = self.annotations.get(&id).map(|a| (a.version, a.author)) else {
            return;
        };
        let version = self.issue_version(author, floor);
        if let Some(ann) = self.annotations.get_mut(&id) {
            ann.status = AnnotationStatus::Deleted;
            ann.version = version;
            ann.modified_at_ms = now_ms;
        }
        self.locks.remove(&id);
    }

    fn detect_and_record(&mut self, candidate: &Candidate, now_ms: u64) -> Vec<Conflict> {
        self.prune_recent(now_ms);
        let recent: Vec<RecentEdit> = self.recent_edits.iter().cloned().collect();
        let found = detect(candidate, &self.annotations, &recent, &self.conflict_cfg);
        for conflict in &found {
            self.conflicts.insert(conflict.id, conflict.clone());
        }
        found
    }

    fn record_edit(&mut self, annotation: Uuid, author: Uuid, now_ms: u64) {
        self.recent_edits.push_back(RecentEdit {
            annotation,
            author,
            at_ms: now_ms,
        });
        self.prune_recent(now_ms);
    }

    fn prune_recent(&mut self, now_ms: u64) {
        let horizon = now_ms.saturating_sub(self.cfg.recent_edit_window_ms);
        while self
            .recent_edits
            .front()
            .is_some_and(|e| e.at_ms < horizon)
        {
            self.recent_edits.pop_front();
        }
    }

    /// Next version for `author`, also strictly above `floor` so annotation
    /// versions never regress no matter who edits them.
    fn issue_version(&mut self, author: Uuid, floor: u64) -> u64 {
        let version = (self.versions.get(&author) + 1).max(floor + 1);
        self.versions.observe(author, version);
        version
    }
}
