//! Caller-side handle for a scheduled completion request.
//!
//! The scheduler owns the sending half ([`HandleSlot`]) and resolves it exactly
//! once. Any number of handles may observe the same request; dropping a
//! handle never affects the request itself.

use std::time::Duration;

use tokio::sync::watch;

use super::provider::CompletionOutcome;
use super::types::{Completion, PriorityClass, RequestId};
use super::SchedulerError;

/// Observable lifecycle of a scheduled request.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleState {
    /// Waiting in the priority queue.
    Pending,
    /// A worker has picked the request up (possibly retrying).
    Running,
    /// Finished, successfully or with a terminal provider failure.
    Ready(CompletionOutcome),
    /// Removed from the queue before any worker started it.
    Cancelled,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Cancelled)
    }
}

/// Scheduler-side resolver for one request.
#[derive(Debug)]
pub(crate) struct HandleSlot {
    tx: watch::Sender<HandleState>,
}

impl HandleSlot {
    pub(crate) fn new(request_id: RequestId, priority: PriorityClass) -> (Self, CompletionHandle) {
        let (tx, rx) = watch::channel(HandleState::Pending);
        let handle = CompletionHandle {
            request_id,
            priority,
            rx,
        };
        (Self { tx }, handle)
    }

    pub(crate) fn mark_running(&self) {
        self.tx.send_replace(HandleState::Running);
    }

    pub(crate) fn resolve(self, outcome: CompletionOutcome) {
        self.tx.send_replace(HandleState::Ready(outcome));
    }

    pub(crate) fn cancel(self) {
        self.tx.send_replace(HandleState::Cancelled);
    }
}

/// Future-like handle returned by [`RequestScheduler::submit`](super::RequestScheduler::submit).
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    request_id: RequestId,
    priority: PriorityClass,
    rx: watch::Receiver<HandleState>,
}

impl CompletionHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    /// Non-blocking snapshot of the request state.
    pub fn poll(&self) -> HandleState {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_terminal()
    }

    /// Suspend until the request finishes or `timeout` elapses.
    ///
    /// A timeout only ends this wait; the request keeps running and a later
    /// `wait` or `poll` can still observe its result.
    pub async fn wait(&self, timeout: Duration) -> Result<Completion, SchedulerError> {
        let mut rx = self.rx.clone();
        let state = match tokio::time::timeout(timeout, rx.wait_for(HandleState::is_terminal)).await
        {
            Err(_) => {
                return Err(SchedulerError::Timeout {
                    request_id: self.request_id.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => return Err(SchedulerError::ShutDown),
            Ok(Ok(state)) => (*state).clone(),
        };

        match state {
            HandleState::Ready(Ok(completion)) => Ok(completion),
            HandleState::Ready(Err(failure)) => Err(SchedulerError::Provider(failure)),
            HandleState::Cancelled => Err(SchedulerError::Cancelled(self.request_id.clone())),
            HandleState::Pending | HandleState::Running => Err(SchedulerError::ShutDown),
        }
    }
}
