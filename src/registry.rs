//! Correlation of outbound reads with inbound callbacks
//!
//! The script side answers a read by raising a named callback that carries
//! only the callback id. `CorrelationRegistry` maps those ids to the oneshot
//! senders of the waiting readers. An entry is removed by exactly one of
//! resolve, fail, or cancel; whichever comes later finds nothing and returns
//! `false`. Late and duplicate callbacks are an expected outcome of local
//! cancellation and are dropped quietly.

use crate::error::{FileReaderError, Result};
use crate::protocol::CallbackId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

type Completion<T> = oneshot::Sender<Result<T>>;

/// Table of pending calls keyed by callback id
pub struct CorrelationRegistry<T> {
    pending: Arc<Mutex<HashMap<CallbackId, Completion<T>>>>,
}

impl<T> Clone for CorrelationRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for CorrelationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CorrelationRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

impl<T> CorrelationRegistry<T> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallbackId, Completion<T>>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pending call under `id`
    ///
    /// Ids come from a unique generator, so a duplicate is a programming
    /// error. It is rejected without touching the existing entry.
    pub fn register(&self, id: CallbackId) -> Result<PendingCall<T>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            debug_assert!(
                !pending.contains_key(&id),
                "callback id {id} registered twice"
            );
            if pending.contains_key(&id) {
                tracing::error!("callback id {} registered twice", id);
                return Err(FileReaderError::InvalidArgument(format!(
                    "callback id {id} is already pending"
                )));
            }
            pending.insert(id.clone(), tx);
        }
        tracing::trace!("registered pending call {}", id);
        Ok(PendingCall {
            id,
            receiver: rx,
            registry: self.clone(),
        })
    }

    /// Remove the entry for `id` and complete it with `value`
    ///
    /// Returns false when no such entry exists (stale or duplicate callback).
    pub fn resolve(&self, id: &CallbackId, value: T) -> bool {
        self.complete(id, Ok(value))
    }

    /// Remove the entry for `id` and complete it with `error`
    pub fn fail(&self, id: &CallbackId, error: FileReaderError) -> bool {
        self.complete(id, Err(error))
    }

    /// Remove the entry for `id`, completing it as cancelled
    pub fn cancel(&self, id: &CallbackId) -> bool {
        self.complete(id, Err(FileReaderError::Cancelled))
    }

    fn complete(&self, id: &CallbackId, result: Result<T>) -> bool {
        let sender = self.lock().remove(id);
        match sender {
            Some(sender) => {
                // The receiver may already be gone if its reader was dropped
                // between removal and send; the entry is consumed either way.
                let _ = sender.send(result);
                true
            }
            None => {
                tracing::debug!("ignoring completion for unknown callback id {}", id);
                false
            }
        }
    }

    pub fn contains(&self, id: &CallbackId) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of calls still waiting for a completion
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered call waiting for its completion
///
/// Dropping it removes the registry entry, so an abandoned read never leaks
/// and a later callback for it is treated as stale.
pub struct PendingCall<T> {
    id: CallbackId,
    receiver: oneshot::Receiver<Result<T>>,
    registry: CorrelationRegistry<T>,
}

impl<T> PendingCall<T> {
    pub fn id(&self) -> &CallbackId {
        &self.id
    }

    /// Wait for the completion, or fail with `Cancelled` once `cancel` fires
    ///
    /// Cancellation only stops listening: whatever the script side is doing
    /// runs to completion and its callback is discarded.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<T> {
        tokio::select! {
            biased;
            result = &mut self.receiver => {
                result.unwrap_or_else(|_| {
                    Err(FileReaderError::Host(format!(
                        "completion for callback {} was dropped",
                        self.id
                    )))
                })
            }
            _ = cancel.cancelled() => {
                self.registry.cancel(&self.id);
                tracing::debug!("pending call {} cancelled locally", self.id);
                Err(FileReaderError::Cancelled)
            }
        }
    }
}

impl<T> Drop for PendingCall<T> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

/// Source of fresh callback ids
///
/// The counter never wraps in practice and is never reset, so an id is
/// never handed out twice within a process run.
#[derive(Debug)]
pub struct CallbackIdGenerator {
    next: AtomicU64,
}

impl Default for CallbackIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_sequence(&self) -> CallbackId {
        CallbackId::Sequence(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_token(&self) -> CallbackId {
        CallbackId::token()
    }
}
