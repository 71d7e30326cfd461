//! Session-side annotation records and the per-room annotation arena.
//!
//! Annotations live in an indexed table ([`AnnotationSet`]) keyed by id;
//! conflicts and operations reference them by id only, never by pointer.
//! Deletion is a soft delete: the tombstone stays in the arena so concurrent
//! peers can still resolve against it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::op::{OpKind, Operation};
use crate::span::{Span, SpanError};

/// Validation failures for drafts and patches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Span(#[from] SpanError),
    #[error("label set must not be empty")]
    NoLabels,
    #[error("label must not be blank")]
    BlankLabel,
    #[error("operation has no effect")]
    EmptyOperation,
}

/// Lifecycle status. Deleted annotations remain as tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationStatus {
    Active,
    Deleted,
}

/// An accepted annotation as seen by a collaboration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub span: Span,
    pub labels: BTreeSet<String>,
    pub author: Uuid,
    /// Per-author version, strictly increasing within a room.
    pub version: u64,
    pub status: AnnotationStatus,
    pub modified_at_ms: u64,
}

impl Annotation {
    pub fn is_active(&self) -> bool {
        self.status == AnnotationStatus::Active
    }
}

/// A not-yet-accepted annotation submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDraft {
    pub start: u64,
    pub end: u64,
    pub labels: BTreeSet<String>,
}

impl AnnotationDraft {
    pub fn new(start: u64, end: u64, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            start,
            end,
            labels: labels.into_iter().collect(),
        }
    }

    /// Validate the draft, returning the checked span.
    pub fn validate(&self) -> Result<Span, ValidationError> {
        let span = Span::new(self.start, self.end)?;
        validate_labels(&self.labels)?;
        Ok(span)
    }
}

/// A partial update to an existing annotation.
///
/// `base_version` is the version the client last saw; a stale base is
/// rejected with a version conflict before any state is touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationPatch {
    pub base_version: u64,
    pub span: Option<Span>,
    pub labels: Option<BTreeSet<String>>,
}

impl AnnotationPatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(labels) = &self.labels {
            validate_labels(labels)?;
        }
        Ok(())
    }
}

fn validate_labels(labels: &BTreeSet<String>) -> Result<(), ValidationError> {
    if labels.is_empty() {
        return Err(ValidationError::NoLabels);
    }
    if labels.iter().any(|l| l.trim().is_empty()) {
        return Err(ValidationError::BlankLabel);
    }
    Ok(())
}

/// The per-room annotation arena: an indexed table keyed by id.
///
/// Iteration order is the id order (BTreeMap), which keeps every scan over
/// the arena deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSet {
    entries: BTreeMap<Uuid, Annotation>,
}

impl AnnotationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, annotation: Annotation) {
        self.entries.insert(annotation.id, annotation);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Annotation> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Annotation> {
        self.entries.get_mut(id)
    }

    /// All entries, tombstones included, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.entries.values()
    }

    /// Active entries only, in id order.
    pub fn active(&self) -> impl Iterator<Item = &Annotation> {
        self.entries.values().filter(|a| a.is_active())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Apply an operation's span effect to the arena.
    ///
    /// Text edits remap every active span; an annotation whose covered text
    /// is fully deleted collapses to a one-char remnant at the deletion
    /// point rather than vanishing (tombstoning here would break
    /// convergence against a concurrent move). Move and relabel touch only
    /// their target. Versions and timestamps are the synchronization
    /// engine's business, not handled here.
    pub fn apply(&mut self, op: &Operation) {
        match &op.kind {
            OpKind::InsertText { at, len } => {
                if *len == 0 {
                    return;
                }
                for ann in self.entries.values_mut().filter(|a| a.is_active()) {
                    ann.span = ann.span.map_insert(*at, *len);
                }
            }
            OpKind::DeleteText { span } => {
                for ann in self.entries.values_mut().filter(|a| a.is_active()) {
                    ann.span = ann.span.map_delete_clamped(span);
                }
            }
            OpKind::MoveSpan { target, span } => {
                if let Some(ann) = self.entries.get_mut(target) {
                    if ann.is_active() {
                        ann.span = *span;
                    }
                }
            }
            OpKind::Relabel { target, labels } => {
                if let Some(ann) = self.entries.get_mut(target) {
                    if ann.is_active() {
                        ann.labels = labels.clone();
                    }
                }
            }
        }
    }

    /// Order-insensitive view used to compare replica states.
    ///
    /// Tombstone content is excluded: once an annotation is deleted its last
    /// span and labels carry no meaning and may differ between arrival
    /// orders. Only `(id, deleted)` identity survives.
    pub fn fingerprint(&self) -> BTreeMap<Uuid, Option<(Span, BTreeSet<String>)>> {
        self.entries
            .values()
            .map(|a| {
                let content = a.is_active().then(|| (a.span, a.labels.clone()));
                (a.id, content)
            })
            .collect()
    }
}
