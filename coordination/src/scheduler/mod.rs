//! Request scheduler for the external completion provider
//!
//! Many logical requests (chat, intervention text, analysis, requirement
//! synthesis) are multiplexed onto a fixed pool of workers. The scheduler
//! knows nothing about segments or staleness; it only orders, executes,
//! retries and reports.
//!
//! # Architecture
//!
//! ```text
//!  submit() ──▶ ┌────────────────────────┐      ┌──────────┐
//!               │  PendingQueue          │─pop─▶│ worker 1 │──┐
//!  cancel() ──▶ │ (rank, time, sequence) │      ├──────────┤  │  complete()
//!               └────────────────────────┘─pop─▶│ worker N │──┼──────────▶ provider
//!                                               └──────────┘  │
//!  CompletionHandle ◀── watch ── HandleSlot::resolve ◀────────┘
//! ```
//!
//! Each worker runs one request at a time: every attempt is bounded by the
//! model's timeout, and transient failures back off inside the worker so a
//! struggling provider never sees more than `max_concurrent_requests` calls.
//!
//! # Usage
//!
//! ```ignore
//! let scheduler = RequestScheduler::start(provider, SchedulerConfig::default());
//! let handle = scheduler.submit(messages, PriorityClass::Chat, ModelParams::new("gpt-4"));
//! let completion = handle.wait(Duration::from_secs(30)).await?;
//! ```

pub mod handle;
pub mod provider;
pub(crate) mod queue;
pub mod retry;
pub mod types;
mod worker;

use thiserror::Error;

pub use handle::{CompletionHandle, HandleState};
pub use provider::{
    CompletionOutcome, CompletionProvider, ProviderError, ProviderErrorKind, ProviderFailure,
};
pub use retry::RetryPolicy;
pub use types::{
    ChatMessage, Completion, CompletionRequest, ModelParams, PriorityClass, RequestId,
    TokenLogprob, Usage,
};
pub use worker::{InFlightRequest, RequestScheduler, SchedulerStats, SharedRequestScheduler};

/// Error type for awaiting scheduled requests
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Provider(#[from] ProviderFailure),

    #[error("Timed out after {waited_ms}ms waiting for request {request_id}")]
    Timeout {
        request_id: RequestId,
        waited_ms: u64,
    },

    #[error("Request {0} was cancelled before it started")]
    Cancelled(RequestId),

    #[error("Scheduler shut down")]
    ShutDown,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
