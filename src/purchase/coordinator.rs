//! Single-slot rendezvous between a purchase and its settlement
//!
//! A purchase calls [`PendingOperationCoordinator::begin`] and later waits
//! on the returned [`WaitHandle`]. Any of the settlement sources (push
//! message, dialog, transport watcher, timeout) may race to settle it; the
//! first one wins and every later attempt is reported and ignored.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final result of a purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Success { license_name: String },
    Failure { reason: String },
    UserCancelled,
    Timeout,
    TransportFailed { reason: String },
}

/// What happened to a settle attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled,
    /// Lost the race; another source settled first
    AlreadySettled,
    NoPendingOperation,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("A purchase is already awaiting confirmation (operation {operation_id})")]
    AlreadyPending { operation_id: Uuid },
}

#[derive(Debug)]
struct PendingOperation {
    id: Uuid,
    settled: bool,
    sender: Option<oneshot::Sender<OperationResult>>,
}

type Slot = Arc<Mutex<Option<PendingOperation>>>;

#[derive(Clone, Default)]
pub struct PendingOperationCoordinator {
    slot: Slot,
}

impl PendingOperationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the single pending operation
    pub fn begin(&self) -> Result<WaitHandle, CoordinatorError> {
        let mut slot = lock(&self.slot);
        if let Some(existing) = slot.as_ref() {
            return Err(CoordinatorError::AlreadyPending {
                operation_id: existing.id,
            });
        }

        let (sender, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        *slot = Some(PendingOperation {
            id,
            settled: false,
            sender: Some(sender),
        });
        debug!(operation_id = %id, "Pending operation opened");

        Ok(WaitHandle {
            id,
            created_at: Utc::now(),
            receiver,
            slot: Arc::clone(&self.slot),
        })
    }

    pub fn settle_success<S: Into<String>>(&self, license_name: S) -> SettleOutcome {
        settle(
            &self.slot,
            None,
            OperationResult::Success {
                license_name: license_name.into(),
            },
        )
    }

    pub fn settle_failure<S: Into<String>>(&self, reason: S) -> SettleOutcome {
        settle(
            &self.slot,
            None,
            OperationResult::Failure {
                reason: reason.into(),
            },
        )
    }

    pub fn settle_user_cancelled(&self) -> SettleOutcome {
        settle(&self.slot, None, OperationResult::UserCancelled)
    }

    /// Cancel operation `operation_id` only; a later operation in the slot
    /// is left alone
    pub fn settle_user_cancelled_for(&self, operation_id: Uuid) -> SettleOutcome {
        settle(&self.slot, Some(operation_id), OperationResult::UserCancelled)
    }

    pub fn settle_transport_failed<S: Into<String>>(&self, reason: S) -> SettleOutcome {
        settle(
            &self.slot,
            None,
            OperationResult::TransportFailed {
                reason: reason.into(),
            },
        )
    }

    /// Wait for the operation behind `handle`, settling it as
    /// [`OperationResult::Timeout`] if nothing arrives in time
    pub async fn wait(&self, handle: WaitHandle, timeout: Duration) -> OperationResult {
        handle.wait(timeout).await
    }

    /// Whether an operation is open (settled or not, but not yet consumed)
    pub fn has_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

/// Caller's side of a pending operation.
///
/// Dropping the handle closes the operation, so an abandoned purchase never
/// blocks the next one.
#[derive(Debug)]
pub struct WaitHandle {
    id: Uuid,
    created_at: DateTime<Utc>,
    receiver: oneshot::Receiver<OperationResult>,
    slot: Slot,
}

impl WaitHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn wait(mut self, timeout: Duration) -> OperationResult {
        let received = tokio::time::timeout(timeout, &mut self.receiver).await;
        match received {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => OperationResult::TransportFailed {
                reason: "settlement channel closed".to_string(),
            },
            Err(_) => match settle(&self.slot, Some(self.id), OperationResult::Timeout) {
                SettleOutcome::Settled => {
                    info!(operation_id = %self.id, timeout_ms = timeout.as_millis() as u64, "Pending operation timed out");
                    OperationResult::Timeout
                }
                // someone settled between the deadline and our settle attempt
                _ => self.receiver.try_recv().unwrap_or(OperationResult::Timeout),
            },
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().map(|operation| operation.id) == Some(self.id) {
            *slot = None;
            debug!(operation_id = %self.id, "Pending operation closed");
        }
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<PendingOperation>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn settle(slot: &Slot, expected: Option<Uuid>, result: OperationResult) -> SettleOutcome {
    let mut slot = lock(slot);
    match slot.as_mut() {
        None => {
            debug!(?result, "No pending operation to settle");
            SettleOutcome::NoPendingOperation
        }
        Some(operation) if expected.is_some_and(|id| id != operation.id) => {
            SettleOutcome::NoPendingOperation
        }
        Some(operation) if operation.settled => {
            warn!(operation_id = %operation.id, ?result, "Operation already settled; ignoring");
            SettleOutcome::AlreadySettled
        }
        Some(operation) => {
            operation.settled = true;
            if let Some(sender) = operation.sender.take() {
                // receiver gone means the waiter was dropped; nothing to deliver
                let _ = sender.send(result);
            }
            SettleOutcome::Settled
        }
    }
}
