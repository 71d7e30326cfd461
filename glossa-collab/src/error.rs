//! Coordinator error taxonomy.
//!
//! Validation, access, lock, and version errors are returned synchronously
//! to the requesting connection only. Conflicts are broadcast to the room
//! and are not errors. Persistence failures are logged and retried off the
//! hot path; they never fail the real-time operation that triggered them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use glossa_core::{ResolveError, ValidationError};

/// Everything that can go wrong inside the coordinator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    #[error("invalid operation: {0}")]
    Validation(#[from] ValidationError),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("annotation {annotation} is locked by another author")]
    LockConflict { annotation: Uuid },
    #[error("stale base version {base} for annotation {annotation} (current {current})")]
    VersionConflict {
        annotation: Uuid,
        base: u64,
        current: u64,
    },
    #[error("unknown annotation {0}")]
    UnknownAnnotation(Uuid),
    #[error("unknown conflict {0}")]
    UnknownConflict(Uuid),
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolveError),
    #[error("persistence degraded: {0}")]
    PersistenceDegraded(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("room is closed")]
    RoomClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Wire-level error category sent back to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    AccessDenied,
    LockConflict,
    VersionConflict,
    PersistenceDegraded,
    CapacityExceeded,
    RoomClosed,
    Protocol,
}

impl CollabError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::Validation(_)
            | CollabError::UnknownAnnotation(_)
            | CollabError::UnknownConflict(_)
            | CollabError::Resolution(_) => ErrorCode::Validation,
            CollabError::AccessDenied(_) => ErrorCode::AccessDenied,
            CollabError::LockConflict { .. } => ErrorCode::LockConflict,
            CollabError::VersionConflict { .. } => ErrorCode::VersionConflict,
            CollabError::PersistenceDegraded(_) => ErrorCode::PersistenceDegraded,
            CollabError::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
            CollabError::RoomClosed => ErrorCode::RoomClosed,
            CollabError::Protocol(_) => ErrorCode::Protocol,
        }
    }
}
