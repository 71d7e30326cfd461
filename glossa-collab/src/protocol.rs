//! Binary wire protocol between client transports and the coordinator.
//!
//! Every message is a tagged variant with a typed payload, so consumers
//! exhaustively match instead of shape-checking at runtime. Frames are
//! bincode-encoded (standard config) for minimal overhead.
//!
//! Server frames carry a per-connection sequence number:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ seq (u64)│ ServerMessage (tagged union) │
//! └──────────┴──────────────────────────────┘
//! ```
//! Clients echo the sequence back in `Ack`, which doubles as an activity
//! heartbeat and clears delivery-retry bookkeeping.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use glossa_core::{
    Annotation, AnnotationDraft, AnnotationPatch, Conflict, Operation, Resolution,
    ResolutionStrategy, Span, VersionVector,
};

use crate::error::{CollabError, ErrorCode};
pub use crate::presence::{Activity, PresenceStatus};

/// Role attached to a verified identity. The identity collaborator has
/// already authenticated the user; the coordinator only consumes the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Read-only participant.
    Observer,
    Annotator,
    Reviewer,
    Admin,
}

impl Role {
    /// Reviewer and Admin may delete others' work and issue expert overrides.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Reviewer | Role::Admin)
    }

    pub fn can_annotate(&self) -> bool {
        !matches!(self, Role::Observer)
    }
}

/// A pre-verified `(user, role)` pair supplied by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: Uuid,
    pub role: Role,
}

/// Member entry inside a room snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user: Uuid,
    pub role: Role,
    pub name: String,
    pub status: PresenceStatus,
}

/// Ephemeral cursor/selection state. Never queued for offline recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub position: u64,
    pub selection: Option<Span>,
}

/// Messages from a client transport to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first message on a connection.
    Join {
        room: Uuid,
        identity: Identity,
        name: String,
    },
    Leave,
    CreateAnnotation {
        request: Uuid,
        draft: AnnotationDraft,
    },
    UpdateAnnotation {
        request: Uuid,
        annotation: Uuid,
        patch: AnnotationPatch,
    },
    DeleteAnnotation {
        request: Uuid,
        annotation: Uuid,
    },
    Lock {
        request: Uuid,
        annotation: Uuid,
        ttl_ms: Option<u64>,
    },
    Unlock {
        request: Uuid,
        annotation: Uuid,
    },
    CursorUpdate {
        cursor: CursorState,
    },
    /// A span operation with the last room op sequence the client had seen;
    /// the gap determines which concurrent ops it is transformed against.
    TextOperation {
        request: Uuid,
        op: Operation,
        seen_seq: u64,
    },
    ResolveConflict {
        request: Uuid,
        conflict: Uuid,
        strategy: ResolutionStrategy,
        winner: Option<Uuid>,
    },
    Vote {
        conflict: Uuid,
        choice: Uuid,
    },
    Ack {
        seq: u64,
    },
    Ping,
}

/// Messages from the coordinator to client transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Snapshot sent on join.
    RoomState {
        room: Uuid,
        members: Vec<MemberInfo>,
        annotations: Vec<Annotation>,
        versions: VersionVector,
        conflicts: Vec<Conflict>,
    },
    PresenceChanged {
        user: Uuid,
        status: PresenceStatus,
        activity: Activity,
    },
    AnnotationCreated {
        annotation: Annotation,
    },
    AnnotationUpdated {
        annotation: Annotation,
    },
    AnnotationDeleted {
        annotation: Uuid,
        author: Uuid,
    },
    ConflictDetected {
        conflict: Conflict,
    },
    ConflictResolved {
        resolution: Resolution,
    },
    /// A transformed span operation applied to the room, with its room-wide
    /// sequence number.
    OperationApplied {
        seq: u64,
        op: Operation,
    },
    /// Cursor/selection movement from another member.
    CursorMoved {
        user: Uuid,
        cursor: CursorState,
    },
    /// Precedes the replay of queued messages after a reconnect.
    QueuedNotification {
        count: usize,
    },
    /// Synchronous failure, delivered only to the requester.
    OperationFailed {
        request: Uuid,
        code: ErrorCode,
        reason: String,
    },
    Pong,
}

impl ServerMessage {
    /// Ephemeral messages are dropped for unreachable recipients instead of
    /// being queued.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ServerMessage::CursorMoved { .. } | ServerMessage::Pong)
    }
}

/// A sequenced server frame as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub seq: u64,
    pub body: ServerMessage,
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Protocol(e.to_string()))?;
        Ok(frame)
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Protocol(e.to_string()))?;
        Ok(msg)
    }
}
