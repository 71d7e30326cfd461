//! Conflict detection and resolution for concurrent annotation work.
//!
//! Detection compares a candidate change against the room's annotation arena
//! and a window of recent edits. It is deterministic: the arena is scanned in
//! id order, so identical inputs always yield the same conflict set no matter
//! when or how often it is called.
//!
//! Detected conflicts are surfaced to the whole room and stay `Pending`
//! without blocking unrelated operations; resolution runs one of four
//! strategies and returns the arena changes to apply.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::annotation::AnnotationSet;
use crate::span::Span;

/// Tunable detection and resolution thresholds.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Minimum overlap ratio (of the shorter span) to flag an overlap.
    pub overlap_threshold: f64,
    /// Boundary tolerance in characters for duplicate/disagreement checks.
    pub boundary_tolerance: u64,
    /// Window within which edits by different authors count as concurrent.
    pub concurrent_window_ms: u64,
    /// Explicit vote quorum; `None` means simple majority of active members.
    pub vote_quorum: Option<usize>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.3,
            boundary_tolerance: 5,
            concurrent_window_ms: 30_000,
            vote_quorum: None,
        }
    }
}

/// What kind of disagreement was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Spans intersect beyond the overlap threshold.
    Overlap,
    /// Near-identical spans with the same label set.
    Duplicate,
    /// Near-identical spans with differing label sets.
    Disagreement,
    /// Same annotation edited by different authors within the window.
    ConcurrentEdit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Dismissed,
}

/// How a conflict can be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Merge near-duplicates into one annotation. Auto-resolvable only.
    AutoMerge,
    /// Quorum vote over active room participants.
    Vote,
    /// Privileged-role decision, wins unconditionally.
    ExpertOverride,
    /// Deterministic split of the overlapping region at its midpoint.
    BoundaryAdjustment,
}

/// A detected conflict. Participants are referenced by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub kind: ConflictKind,
    /// 1 (cosmetic) to 5 (blocking-level disagreement).
    pub severity: u8,
    /// Participant annotation ids, candidate last.
    pub annotations: Vec<Uuid>,
    /// Authors involved.
    pub authors: Vec<Uuid>,
    pub status: ConflictStatus,
    pub auto_resolvable: bool,
    pub suggestion: ResolutionStrategy,
    pub detected_at_ms: u64,
}

impl Conflict {
    /// Identity of the conflict minus the generated id and timestamp; two
    /// detections over the same inputs produce equal signatures.
    pub fn signature(&self) -> (ConflictKind, Vec<Uuid>, u8, bool, ResolutionStrategy) {
        (
            self.kind,
            self.annotations.clone(),
            self.severity,
            self.auto_resolvable,
            self.suggestion,
        )
    }
}

/// A candidate create or update to check against the arena.
///
/// `annotation` carries the (pre-assigned) id of the annotation being
/// created or updated; it is excluded from span comparisons against itself.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub annotation: Option<Uuid>,
    pub span: Span,
    pub labels: BTreeSet<String>,
    pub author: Uuid,
    pub at_ms: u64,
}

/// One entry of the recent-edit window kept by the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEdit {
    pub annotation: Uuid,
    pub author: Uuid,
    pub at_ms: u64,
}

/// Detect conflicts between `candidate` and the current room state.
pub fn detect(
    candidate: &Candidate,
    annotations: &AnnotationSet,
    recent: &[RecentEdit],
    cfg: &ConflictConfig,
) -> Vec<Conflict> {
    let mut out = Vec::new();

    for existing in annotations.active() {
        if candidate.annotation == Some(existing.id) {
            continue;
        }

        let near = existing
            .span
            .within_tolerance(&candidate.span, cfg.boundary_tolerance);
        let ratio = existing.span.overlap_ratio(&candidate.span);

        let pair = if near && existing.labels == candidate.labels {
            Some((ConflictKind::Duplicate, 2, true, ResolutionStrategy::AutoMerge))
        } else if near {
            Some((ConflictKind::Disagreement, 4, false, ResolutionStrategy::Vote))
        } else if ratio >= cfg.overlap_threshold {
            let same_labels = existing.labels == candidate.labels;
            let severity = if ratio >= 0.8 {
                4
            } else if ratio >= 0.5 {
                3
            } else {
                2
            };
            let suggestion = if same_labels {
                ResolutionStrategy::AutoMerge
            } else {
                ResolutionStrategy::BoundaryAdjustment
            };
            Some((ConflictKind::Overlap, severity, same_labels, suggestion))
        } else {
            None
        };

        if let Some((kind, severity, auto_resolvable, suggestion)) = pair {
            let mut participants = vec![existing.id];
            participants.extend(candidate.annotation);
            out.push(Conflict {
                id: Uuid::new_v4(),
                kind,
                severity,
                annotations: participants,
                authors: vec![existing.author, candidate.author],
                status: ConflictStatus::Pending,
                auto_resolvable,
                suggestion,
                detected_at_ms: candidate.at_ms,
            });
        }
    }

    // Concurrent edits to the same annotation by different authors.
    if let Some(target) = candidate.annotation {
        let mut others: Vec<Uuid> = recent
            .iter()
            .filter(|e| {
                e.annotation == target
                    && e.author != candidate.author
                    && candidate.at_ms.saturating_sub(e.at_ms) <= cfg.concurrent_window_ms
            })
            .map(|e| e.author)
            .collect();
        others.sort();
        others.dedup();

        if !others.is_empty() {
            let mut authors = others;
            authors.push(candidate.author);
            out.push(Conflict {
                id: Uuid::new_v4(),
                kind: ConflictKind::ConcurrentEdit,
                severity: 3,
                annotations: vec![target],
                authors,
                status: ConflictStatus::Pending,
                auto_resolvable: false,
                suggestion: ResolutionStrategy::Vote,
                detected_at_ms: candidate.at_ms,
            });
        }
    }

    if !out.is_empty() {
        log::debug!(
            "detected {} conflict(s) for author {}",
            out.len(),
            candidate.author
        );
    }
    out
}

/// Resolution failures, returned to the requester only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("conflict is not auto-resolvable")]
    NotAutoResolvable,
    #[error("vote quorum not reached: {got}/{needed}")]
    QuorumNotReached { needed: usize, got: usize },
    #[error("vote resolution requires ballots")]
    MissingBallots,
    #[error("expert override requires an elevated role")]
    NotElevated,
    #[error("unknown annotation {0}")]
    UnknownAnnotation(Uuid),
    #[error("conflict already settled")]
    AlreadySettled,
    #[error("strategy requires exactly two span participants")]
    WrongParticipants,
    #[error("winner {0} is not a participant of this conflict")]
    NotAParticipant(Uuid),
    #[error("overlap too small to split")]
    DegenerateSplit,
}

/// Arena changes produced by a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolutionAction {
    /// Keep `survivor` with the merged span, soft-delete `removed`.
    Merge {
        survivor: Uuid,
        removed: Uuid,
        span: Span,
    },
    /// Keep the winner, soft-delete the rest.
    Keep { winner: Uuid, removed: Vec<Uuid> },
    /// Re-span both participants around the overlap midpoint.
    Split { left: (Uuid, Span), right: (Uuid, Span) },
    /// Leave the arena untouched.
    Dismiss,
}

/// Strategy-specific input to [`Resolver::resolve`].
#[derive(Debug, Clone)]
pub enum ResolutionInput {
    /// No extra input; used by AutoMerge and BoundaryAdjustment.
    Auto,
    /// Ballots: voter id to the annotation id they back.
    Votes {
        ballots: BTreeMap<Uuid, Uuid>,
        active_participants: usize,
    },
    /// A privileged decision in favor of `winner`.
    Override {
        decider: Uuid,
        elevated: bool,
        winner: Uuid,
    },
}

/// Executes resolution strategies against the arena.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    cfg: ConflictConfig,
}

/// The outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub conflict: Uuid,
    pub strategy: ResolutionStrategy,
    pub actions: Vec<ResolutionAction>,
}

impl Resolver {
    pub fn new(cfg: ConflictConfig) -> Self {
        Self { cfg }
    }

    pub fn resolve(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        input: &ResolutionInput,
        annotations: &AnnotationSet,
    ) -> Result<Resolution, ResolveError> {
        if conflict.status != ConflictStatus::Pending {
            return Err(ResolveError::AlreadySettled);
        }

        let actions = match strategy {
            ResolutionStrategy::AutoMerge => self.auto_merge(conflict, annotations)?,
            ResolutionStrategy::Vote => self.vote(conflict, input)?,
            ResolutionStrategy::ExpertOverride => self.expert_override(conflict, input)?,
            ResolutionStrategy::BoundaryAdjustment => self.boundary_adjust(conflict, annotations)?,
        };

        Ok(Resolution {
            conflict: conflict.id,
            strategy,
            actions,
        })
    }

    /// Dismiss without touching the arena.
    pub fn dismiss(&self, conflict: &Conflict) -> Result<Resolution, ResolveError> {
        if conflict.status != ConflictStatus::Pending {
            return Err(ResolveError::AlreadySettled);
        }
        Ok(Resolution {
            conflict: conflict.id,
            strategy: conflict.suggestion,
            actions: vec![ResolutionAction::Dismiss],
        })
    }

    fn auto_merge(
        &self,
        conflict: &Conflict,
        annotations: &AnnotationSet,
    ) -> Result<Vec<ResolutionAction>, ResolveError> {
        if !conflict.auto_resolvable {
            return Err(ResolveError::NotAutoResolvable);
        }
        let (first, second) = two_participants(conflict)?;
        let a = annotations
            .get(&first)
            .ok_or(ResolveError::UnknownAnnotation(first))?;
        let b = annotations
            .get(&second)
            .ok_or(ResolveError::UnknownAnnotation(second))?;

        // The earlier annotation survives; ties break on id.
        let (survivor, removed) = if (a.modified_at_ms, a.id) <= (b.modified_at_ms, b.id) {
            (a, b)
        } else {
            (b, a)
        };

        Ok(vec![ResolutionAction::Merge {
            survivor: survivor.id,
            removed: removed.id,
            span: a.span.union(&b.span),
        }])
    }

    fn vote(
        &self,
        conflict: &Conflict,
        input: &ResolutionInput,
    ) -> Result<Vec<ResolutionAction>, ResolveError> {
        let ResolutionInput::Votes {
            ballots,
            active_participants,
        } = input
        else {
            return Err(ResolveError::MissingBallots);
        };

        let needed = self
            .cfg
            .vote_quorum
            .unwrap_or(active_participants / 2 + 1)
            .max(1);

        let mut tally: BTreeMap<Uuid, usize> = BTreeMap::new();
        for choice in ballots.values() {
            *tally.entry(*choice).or_insert(0) += 1;
        }

        let top = tally.iter().max_by_key(|(_, n)| **n);
        match top {
            Some((winner, count)) if *count >= needed => {
                if !conflict.annotations.contains(winner) {
                    return Err(ResolveError::NotAParticipant(*winner));
                }
                let removed = conflict
                    .annotations
                    .iter()
                    .copied()
                    .filter(|id| id != winner)
                    .collect();
                Ok(vec![ResolutionAction::Keep {
                    winner: *winner,
                    removed,
                }])
            }
            Some((_, count)) => Err(ResolveError::QuorumNotReached {
                needed,
                got: *count,
            }),
            None => Err(ResolveError::QuorumNotReached { needed, got: 0 }),
        }
    }

    fn expert_override(
        &self,
        conflict: &Conflict,
        input: &ResolutionInput,
    ) -> Result<Vec<ResolutionAction>, ResolveError> {
        let ResolutionInput::Override {
            elevated, winner, ..
        } = input
        else {
            return Err(ResolveError::NotElevated);
        };
        if !elevated {
            return Err(ResolveError::NotElevated);
        }
        if !conflict.annotations.contains(winner) {
            return Err(ResolveError::NotAParticipant(*winner));
        }
        let removed = conflict
            .annotations
            .iter()
            .copied()
            .filter(|id| id != winner)
            .collect();
        Ok(vec![ResolutionAction::Keep {
            winner: *winner,
            removed,
        }])
    }

    fn boundary_adjust(
        &self,
        conflict: &Conflict,
        annotations: &AnnotationSet,
    ) -> Result<Vec<ResolutionAction>, ResolveError> {
        let (first, second) = two_participants(conflict)?;
        let a = annotations
            .get(&first)
            .ok_or(ResolveError::UnknownAnnotation(first))?;
        let b = annotations
            .get(&second)
            .ok_or(ResolveError::UnknownAnnotation(second))?;

        // Left = the span starting first; ties break on id.
        let (left, right) = if (a.span.start(), a.id) <= (b.span.start(), b.id) {
            (a, b)
        } else {
            (b, a)
        };

        let mid = left
            .span
            .overlap_midpoint(&right.span)
            .ok_or(ResolveError::DegenerateSplit)?;

        let left_span =
            Span::new(left.span.start(), mid).map_err(|_| ResolveError::DegenerateSplit)?;
        let right_span =
            Span::new(mid, right.span.end()).map_err(|_| ResolveError::DegenerateSplit)?;

        Ok(vec![ResolutionAction::Split {
            left: (left.id, left_span),
            right: (right.id, right_span),
        }])
    }
}

fn two_participants(conflict: &Conflict) -> Result<(Uuid, Uuid), ResolveError> {
    match conflict.annotations.as_slice() {
        [a, b] => Ok((*a, *b)),
        _ => Err(ResolveError::WrongParticipants),
    }
}
