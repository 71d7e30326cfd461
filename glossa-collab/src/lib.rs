//! # glossa-collab — real-time coordinator for collaborative annotation
//!
//! The runtime that lets multiple users concurrently create, edit, and
//! delete span annotations on a shared document, with live presence, cursor
//! sharing, deterministic conflict handling, and reliable delivery to
//! temporarily disconnected participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient │ ◄────────────────► │ CollabServer │
//! │ (per user) │    binary frames   │  (accept)    │
//! └────────────┘                    └──────┬───────┘
//!                                          │
//!                                   ┌──────▼───────┐    one task per room
//!                                   │   Registry   │ ──► Room owner task
//!                                   │  (routing)   │       │ SyncEngine
//!                                   └──────┬───────┘       │ Presence
//!                                          │               │ Locks
//!                                   ┌──────▼───────┐       │
//!                                   │ MessageQueue │ ◄─────┘ unreachable
//!                                   │ (per user)   │         recipients
//!                                   └──────────────┘
//! ```
//!
//! Room state is owned by exactly one task; every mutation arrives through
//! its mailbox, which totally orders operations per room while rooms run in
//! parallel. Presence and cursor traffic bypass conflict logic entirely.
//!
//! ## Modules
//!
//! - [`protocol`] — tagged binary wire messages (bincode)
//! - [`registry`] — connection/room routing
//! - [`room`] — room owner tasks: membership, fan-out, timers
//! - [`sync`] — annotation synchronization engine (versions, locks, OT)
//! - [`presence`] — online/idle/away tracking
//! - [`queue`] — bounded per-user priority queues with retry policy
//! - [`persist`] — asynchronous persistence collaborator interface
//! - [`server`] / [`client`] — WebSocket endpoints

pub mod client;
pub mod error;
pub mod persist;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod room;
pub mod server;
pub mod sync;

pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use error::{CollabError, ErrorCode};
pub use persist::{AnnotationStore, MemoryStore, PersistenceHandle, StoreError};
pub use presence::{Activity, PresenceConfig, PresenceRecord, PresenceStatus, PresenceTracker};
pub use protocol::{
    ClientMessage, CursorState, Identity, MemberInfo, Role, ServerFrame, ServerMessage,
};
pub use queue::{MessageQueue, Priority, QueueConfig, QueuedMessage, RetryPolicy};
pub use registry::Registry;
pub use room::{ConnectionInfo, DeliveryStatus, RoomConfig, RoomHandle};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use sync::{LockInfo, SyncConfig, SyncEngine};
