//! Asynchronous persistence collaborator interface.
//!
//! The coordinator treats durable storage as an external collaborator:
//! annotation writes are posted to a worker task and retried with backoff
//! off the hot path. An annotation is visible to the whole room before (and
//! regardless of whether) its write ever lands. Each posted write carries a
//! cancellation token so a newer write for the same annotation can cancel a
//! still-pending older one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use glossa_core::Annotation;

use crate::queue::RetryPolicy;

/// Storage collaborator failures. Always retried, never surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The external annotation store, eventual consistency is acceptable.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    async fn upsert(&self, room: Uuid, annotation: &Annotation) -> Result<(), StoreError>;
    async fn remove(&self, room: Uuid, annotation: Uuid) -> Result<(), StoreError>;
}

/// In-memory reference store, also the test double.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(Uuid, Uuid), Annotation>>,
    /// Number of upcoming calls that fail with `Unavailable`.
    fail_next: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail, for exercising the retry path.
    pub async fn fail_next(&self, n: u32) {
        *self.fail_next.lock().await = n;
    }

    pub async fn get(&self, room: Uuid, annotation: Uuid) -> Option<Annotation> {
        self.entries.lock().await.get(&(room, annotation)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn maybe_fail(&self) -> Result<(), StoreError> {
        let mut fail = self.fail_next.lock().await;
        if *fail > 0 {
            *fail -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnnotationStore for MemoryStore {
    async fn upsert(&self, room: Uuid, annotation: &Annotation) -> Result<(), StoreError> {
        self.maybe_fail().await?;
        self.entries
            .lock()
            .await
            .insert((room, annotation.id), annotation.clone());
        Ok(())
    }

    async fn remove(&self, room: Uuid, annotation: Uuid) -> Result<(), StoreError> {
        self.maybe_fail().await?;
        self.entries.lock().await.remove(&(room, annotation));
        Ok(())
    }
}

enum StoreJob {
    Upsert {
        room: Uuid,
        annotation: Annotation,
        cancel: CancellationToken,
    },
    Remove {
        room: Uuid,
        annotation: Uuid,
        cancel: CancellationToken,
    },
}

/// Handle for posting fire-and-forget writes to the persistence worker.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<StoreJob>,
}

impl PersistenceHandle {
    /// Spawn the worker task draining writes into `store`.
    pub fn spawn(store: Arc<dyn AnnotationStore>, retry: RetryPolicy) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreJob>(1024);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let store = store.clone();
                let retry = retry.clone();
                // Each write retries independently so one slow store call
                // never holds up the queue behind it.
                tokio::spawn(async move {
                    run_job(store, retry, job).await;
                });
            }
        });

        Self { tx }
    }

    /// Post an upsert; returns the token that cancels it while pending.
    pub fn upsert(&self, room: Uuid, annotation: Annotation) -> CancellationToken {
        let cancel = CancellationToken::new();
        let job = StoreJob::Upsert {
            room,
            annotation,
            cancel: cancel.clone(),
        };
        if self.tx.try_send(job).is_err() {
            log::error!("persistence worker backlog full, dropping write for room {room}");
        }
        cancel
    }

    /// Post a removal; returns the token that cancels it while pending.
    pub fn remove(&self, room: Uuid, annotation: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        let job = StoreJob::Remove {
            room,
            annotation,
            cancel: cancel.clone(),
        };
        if self.tx.try_send(job).is_err() {
            log::error!("persistence worker backlog full, dropping removal for room {room}");
        }
        cancel
    }
}

async fn run_job(store: Arc<dyn AnnotationStore>, retry: RetryPolicy, job: StoreJob) {
    let (room, target, cancel) = match &job {
        StoreJob::Upsert {
            room, annotation, cancel, ..
        } => (*room, annotation.id, cancel.clone()),
        StoreJob::Remove {
            room, annotation, cancel,
        } => (*room, *annotation, cancel.clone()),
    };

    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            log::debug!("persistence write for annotation {target} superseded, dropping");
            return;
        }

        let result = match &job {
            StoreJob::Upsert { room, annotation, .. } => store.upsert(*room, annotation).await,
            StoreJob::Remove { room, annotation, .. } => store.remove(*room, *annotation).await,
        };

        match result {
            Ok(()) => return,
            Err(e) => {
                attempt += 1;
                if retry.exhausted(attempt) {
                    log::error!(
                        "persistence degraded: annotation {target} in room {room} \
                         not stored after {attempt} attempts: {e}"
                    );
                    return;
                }
                log::warn!(
                    "persistence write for annotation {target} failed (attempt {attempt}): {e}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry.delay_for(attempt - 1)) => {}
                }
            }
        }
    }
}
