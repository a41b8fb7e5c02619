//! Worker pool driving queued requests against the provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ModelConfig, SchedulerConfig};

use super::handle::{CompletionHandle, HandleSlot};
use super::provider::{CompletionOutcome, CompletionProvider, ProviderError, ProviderFailure};
use super::queue::{PendingQueue, QueuedRequest};
use super::retry::RetryPolicy;
use super::types::{ChatMessage, Completion, CompletionRequest, ModelParams, PriorityClass, RequestId};
use super::SchedulerResult;

/// Shared reference to RequestScheduler
pub type SharedRequestScheduler = Arc<RequestScheduler>;

/// Entry in the worker-assignment table.
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub request_id: RequestId,
    pub priority: PriorityClass,
    pub worker_id: usize,
    /// 1-based attempt currently executing or backing off.
    pub attempt: u32,
    pub started_at: Instant,
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub total_tokens: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    total_tokens: AtomicU64,
    peak_in_flight: AtomicUsize,
}

struct SchedulerInner {
    provider: Arc<dyn CompletionProvider>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    queue: Mutex<PendingQueue>,
    in_flight: Mutex<HashMap<RequestId, InFlightRequest>>,
    wake: Notify,
    sequence: AtomicU64,
    shutdown: CancellationToken,
    workers: TaskTracker,
    counters: Counters,
}

// Critical sections never panic; recover the guard rather than propagate poison.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded-concurrency, priority-ordered executor for completion requests.
///
/// Cloning is cheap; all clones share the same queue and worker pool.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<SchedulerInner>,
}

impl RequestScheduler {
    /// Spawn `max_concurrent_requests` workers on the current Tokio runtime.
    pub fn start(provider: Arc<dyn CompletionProvider>, config: SchedulerConfig) -> Self {
        let workers = config.max_concurrent_requests.max(1);
        let inner = Arc::new(SchedulerInner {
            provider,
            retry: config.retry_policy(),
            config,
            queue: Mutex::new(PendingQueue::new()),
            in_flight: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            sequence: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            counters: Counters::default(),
        });

        for worker_id in 0..workers {
            let worker = inner.clone();
            inner.workers.spawn(async move { worker.run(worker_id).await });
        }

        info!(
            workers,
            max_retries = inner.retry.max_retries,
            retry_delay_ms = inner.retry.retry_delay_ms,
            "Request scheduler started"
        );

        Self { inner }
    }

    /// Create a shared reference to this scheduler
    pub fn shared(self) -> SharedRequestScheduler {
        Arc::new(self)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Enqueue a request and return immediately.
    pub fn submit(
        &self,
        messages: Vec<ChatMessage>,
        priority: PriorityClass,
        params: ModelParams,
    ) -> CompletionHandle {
        let params = self.resolve_params(params);
        let request_id = format!(
            "{}_{}_{}",
            Utc::now().timestamp_millis(),
            priority,
            Uuid::new_v4().simple()
        );
        let (slot, handle) = HandleSlot::new(request_id.clone(), priority);

        if self.inner.shutdown.is_cancelled() {
            warn!(request_id = %request_id, "Submit after shutdown, cancelling");
            slot.cancel();
            return handle;
        }

        let queued = {
            let mut queue = lock(&self.inner.queue);
            let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
            queue.push(QueuedRequest {
                request: CompletionRequest {
                    request_id: request_id.clone(),
                    priority,
                    messages,
                    params,
                    submitted_at: Instant::now(),
                    sequence,
                },
                slot,
            });
            queue.len()
        };
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %request_id, %priority, queued, "Request submitted");

        self.inner.wake.notify_one();
        handle
    }

    /// Submit and await the outcome with a caller-supplied timeout.
    pub async fn submit_and_wait(
        &self,
        messages: Vec<ChatMessage>,
        priority: PriorityClass,
        params: ModelParams,
        timeout: Duration,
    ) -> SchedulerResult<Completion> {
        self.submit(messages, priority, params).wait(timeout).await
    }

    /// Remove a request that has not started yet.
    ///
    /// Returns `false` once a worker has picked the request up; the worker
    /// then runs it to completion and the result is left for the caller to
    /// ignore.
    pub fn cancel(&self, handle: &CompletionHandle) -> bool {
        let removed = lock(&self.inner.queue).remove(handle.request_id());
        match removed {
            Some(entry) => {
                entry.slot.cancel();
                self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!(request_id = %handle.request_id(), "Queued request cancelled");
                true
            }
            None => {
                debug!(request_id = %handle.request_id(), "Cancel ignored, request already started or finished");
                false
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            total_tokens: c.total_tokens.load(Ordering::Relaxed),
            queued: lock(&self.inner.queue).len(),
            in_flight: lock(&self.inner.in_flight).len(),
            peak_in_flight: c.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the worker-assignment table.
    pub fn in_flight(&self) -> Vec<InFlightRequest> {
        let mut requests: Vec<InFlightRequest> =
            lock(&self.inner.in_flight).values().cloned().collect();
        requests.sort_by_key(|r| r.worker_id);
        requests
    }

    /// Stop accepting work, cancel everything still queued, and wait for
    /// workers to finish their current request.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained = lock(&self.inner.queue).drain();
        let cancelled = drained.len();
        for entry in drained {
            entry.slot.cancel();
        }
        self.inner
            .counters
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        self.inner.workers.close();
        self.inner.workers.wait().await;
        info!(cancelled, "Request scheduler shut down");
    }

    fn resolve_params(&self, mut params: ModelParams) -> ModelParams {
        let defaults = self.inner.config.model(&params.model);
        params.max_tokens.get_or_insert(defaults.max_tokens);
        params.temperature.get_or_insert(defaults.temperature);
        params
    }
}

impl SchedulerInner {
    async fn run(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Scheduler worker started");
        loop {
            let entry = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                entry = self.next_request() => entry,
            };
            self.execute(entry, worker_id).await;
        }
        debug!(worker_id, "Scheduler worker stopped");
    }

    async fn next_request(&self) -> QueuedRequest {
        loop {
            let notified = self.wake.notified();
            if let Some(entry) = lock(&self.queue).pop() {
                return entry;
            }
            notified.await;
        }
    }

    async fn execute(&self, entry: QueuedRequest, worker_id: usize) {
        let QueuedRequest { request, slot } = entry;
        slot.mark_running();

        let in_flight = {
            let mut table = lock(&self.in_flight);
            table.insert(
                request.request_id.clone(),
                InFlightRequest {
                    request_id: request.request_id.clone(),
                    priority: request.priority,
                    worker_id,
                    attempt: 0,
                    started_at: Instant::now(),
                },
            );
            table.len()
        };
        self.counters
            .peak_in_flight
            .fetch_max(in_flight, Ordering::Relaxed);
        debug!(
            request_id = %request.request_id,
            priority = %request.priority,
            worker_id,
            waited_ms = request.submitted_at.elapsed().as_millis() as u64,
            "Request dispatched"
        );

        let model = self.config.model(&request.params.model).clone();
        let outcome = self.call_with_retry(&request, &model).await;

        lock(&self.in_flight).remove(&request.request_id);
        match &outcome {
            Ok(completion) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(usage) = completion.usage {
                    self.counters
                        .total_tokens
                        .fetch_add(usage.total_tokens, Ordering::Relaxed);
                }
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        slot.resolve(outcome);
    }

    async fn call_with_retry(
        &self,
        request: &CompletionRequest,
        model: &ModelConfig,
    ) -> CompletionOutcome {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(entry) = lock(&self.in_flight).get_mut(&request.request_id) {
                entry.attempt = attempt;
            }

            let result = match tokio::time::timeout(
                model.timeout(),
                self.provider.complete(&request.messages, &request.params),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(format!(
                    "no response from {} within {}ms",
                    request.params.model, model.timeout_ms
                ))),
            };

            let err = match result {
                Ok(completion) => {
                    debug!(request_id = %request.request_id, attempt, "Request completed");
                    return Ok(completion);
                }
                Err(err) => err,
            };

            if err.is_transient() && self.retry.should_retry(attempt) {
                let backoff = self.retry.backoff_duration(attempt);
                warn!(
                    request_id = %request.request_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient provider error, backing off"
                );
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(backoff).await;
                continue;
            }

            error!(
                request_id = %request.request_id,
                attempt,
                error = %err,
                "Request failed permanently"
            );
            return Err(ProviderFailure {
                attempts: attempt,
                last_cause: err,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use super::*;
    use crate::scheduler::handle::HandleState;
    use crate::scheduler::{ProviderErrorKind, SchedulerError};

    /// Replays a fixed script of results, one per call.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<ModelParams>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<Completion, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            params: &ModelParams,
        ) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(params.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Completion::text("default")))
        }
    }

    /// Never answers.
    struct HangingProvider;

    #[async_trait]
    impl CompletionProvider for HangingProvider {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &ModelParams,
        ) -> Result<Completion, ProviderError> {
            std::future::pending().await
        }
    }

    fn config(workers: usize, max_retries: u32) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_requests: workers,
            max_retries,
            retry_delay_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_fills_model_defaults() {
        let provider = ScriptedProvider::new(vec![Ok(Completion::text("hi"))]);
        let scheduler = RequestScheduler::start(provider.clone(), config(1, 0));

        let completion = scheduler
            .submit_and_wait(
                vec![ChatMessage::user("hello")],
                PriorityClass::Chat,
                ModelParams::new("gpt-3.5-turbo").temperature(0.0),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(completion.content, "hi");

        let seen = provider.seen.lock().unwrap().clone();
        assert_eq!(seen[0].max_tokens, Some(300));
        assert_eq!(seen[0].temperature, Some(0.0));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_error_is_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::rejected("bad request"))]);
        let scheduler = RequestScheduler::start(provider.clone(), config(1, 3));

        let err = scheduler
            .submit(vec![], PriorityClass::Analysis, ModelParams::new("gpt-4"))
            .wait(Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            SchedulerError::Provider(failure) => {
                assert_eq!(failure.attempts, 1);
                assert_eq!(failure.last_cause.kind, ProviderErrorKind::Rejected);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().failed, 1);
        assert_eq!(scheduler.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reports_attempts() {
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::transport("reset")),
            Err(ProviderError::transport("reset")),
            Err(ProviderError::rate_limited("429")),
        ]);
        let scheduler = RequestScheduler::start(provider.clone(), config(1, 2));

        let err = scheduler
            .submit_and_wait(
                vec![],
                PriorityClass::Analysis,
                ModelParams::new("gpt-4"),
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        let SchedulerError::Provider(failure) = err else {
            panic!("expected provider failure");
        };
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.last_cause, ProviderError::rate_limited("429"));
        assert_eq!(scheduler.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_model_timeout_counts_as_transient() {
        let mut cfg = config(1, 1);
        cfg.models
            .insert("slow".into(), ModelConfig::new(10, 0.0, 1_000));
        let scheduler = RequestScheduler::start(Arc::new(HangingProvider), cfg);

        let err = scheduler
            .submit_and_wait(
                vec![],
                PriorityClass::Analysis,
                ModelParams::new("slow"),
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        let SchedulerError::Provider(failure) = err else {
            panic!("expected provider failure");
        };
        assert_eq!(failure.attempts, 2);
        assert_eq!(
            failure.last_cause.kind,
            ProviderErrorKind::Timeout
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_queued_requests() {
        let scheduler = RequestScheduler::start(Arc::new(HangingProvider), config(1, 0));
        let running = scheduler.submit(vec![], PriorityClass::Chat, ModelParams::new("gpt-4"));
        tokio::task::yield_now().await;
        let queued = scheduler.submit(vec![], PriorityClass::Chat, ModelParams::new("gpt-4"));

        assert_eq!(running.poll(), HandleState::Running);
        assert_eq!(queued.poll(), HandleState::Pending);
        assert_eq!(scheduler.in_flight().len(), 1);

        // The hanging request times out after its model timeout, then the
        // worker observes shutdown.
        scheduler.shutdown().await;
        assert_eq!(queued.poll(), HandleState::Cancelled);
        assert!(matches!(running.poll(), HandleState::Ready(Err(_))));

        let late = scheduler.submit(vec![], PriorityClass::Chat, ModelParams::new("gpt-4"));
        assert_eq!(late.poll(), HandleState::Cancelled);
    }
}
