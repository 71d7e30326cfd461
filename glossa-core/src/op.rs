//! Span operations issued by collaborators.
//!
//! An [`Operation`] is immutable once issued; the transform engine consumes
//! them by value and produces adjusted copies. Text edits (`InsertText`,
//! `DeleteText`) shift every annotation span in the room; `MoveSpan` re-spans
//! a single annotation; `Relabel` overwrites a label set and is never
//! transformed (staleness is caught by the version check instead).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::span::Span;

/// The effect of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert `len` characters at `at`, shifting later positions right.
    InsertText { at: u64, len: u64 },
    /// Delete the text covered by `span`, shifting later positions left.
    DeleteText { span: Span },
    /// Re-span the annotation `target` to an absolute new range.
    MoveSpan { target: Uuid, span: Span },
    /// Replace the label set of `target`. Pure overwrite, version-guarded.
    Relabel { target: Uuid, labels: BTreeSet<String> },
}

/// An operation with its issuing author and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub author: Uuid,
    /// Wall-clock issue time in milliseconds; part of the tie-break order.
    pub issued_at_ms: u64,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(author: Uuid, issued_at_ms: u64, kind: OpKind) -> Self {
        Self {
            author,
            issued_at_ms,
            kind,
        }
    }

    /// Total order over concurrent operations: `(issued_at_ms, author)`
    /// ascending. Deterministic across replicas.
    pub fn order_key(&self) -> (u64, Uuid) {
        (self.issued_at_ms, self.author)
    }

    /// Whether this operation precedes `other` in the tie-break order.
    pub fn precedes(&self, other: &Operation) -> bool {
        self.order_key() < other.order_key()
    }

    /// The annotation this operation targets, if any.
    pub fn target(&self) -> Option<Uuid> {
        match &self.kind {
            OpKind::MoveSpan { target, .. } | OpKind::Relabel { target, .. } => Some(*target),
            OpKind::InsertText { .. } | OpKind::DeleteText { .. } => None,
        }
    }
}
