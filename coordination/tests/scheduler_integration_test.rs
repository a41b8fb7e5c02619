//! Integration tests for the Request Scheduler
//!
//! Covers priority dispatch, bounded concurrency, retry with backoff,
//! cancellation and caller-side timeouts against fake providers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use survey_coordination::config::SchedulerConfig;
use survey_coordination::events::{EventSink, OutboundEvent};
use survey_coordination::prompts::CONSISTENCY_SYSTEM_PROMPT;
use survey_coordination::scheduler::{
    ChatMessage, Completion, CompletionProvider, HandleState, ModelParams, PriorityClass,
    ProviderError, ProviderErrorKind, RequestScheduler, SchedulerError,
};
use survey_coordination::{CoordinationConfig, SegmentUpdate, SurveyContext, SurveySession};

fn user(text: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(text)]
}

fn params() -> ModelParams {
    ModelParams::new("gpt-4")
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_requests: workers,
        ..Default::default()
    }
}

/// Records call order; the message "blocker" waits for `release`.
struct OrderedProvider {
    calls: Mutex<Vec<String>>,
    release: Notify,
}

impl OrderedProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            release: Notify::new(),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for OrderedProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _params: &ModelParams,
    ) -> Result<Completion, ProviderError> {
        let content = messages[0].content.clone();
        self.calls.lock().unwrap().push(content.clone());
        if content == "blocker" {
            self.release.notified().await;
        }
        Ok(Completion::text(format!("done: {content}")))
    }
}

async fn wait_running(handle: &survey_coordination::CompletionHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.poll() != HandleState::Running {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("request never started");
}

/// Test: requests submitted in reverse priority order are dispatched by rank, FIFO within a class
#[tokio::test]
async fn test_priority_dispatch_order() {
    let provider = OrderedProvider::new();
    let scheduler = RequestScheduler::start(provider.clone(), config(1));

    let blocker = scheduler.submit(user("blocker"), PriorityClass::Chat, params());
    wait_running(&blocker).await;

    let handles = vec![
        scheduler.submit(user("requirement"), PriorityClass::Requirement, params()),
        scheduler.submit(user("analysis-1"), PriorityClass::Analysis, params()),
        scheduler.submit(user("analysis-2"), PriorityClass::Analysis, params()),
        scheduler.submit(user("intervention"), PriorityClass::Intervention, params()),
        scheduler.submit(user("chat"), PriorityClass::Chat, params()),
    ];
    assert_eq!(scheduler.stats().queued, 5);

    provider.release.notify_one();
    for handle in &handles {
        handle.wait(Duration::from_secs(5)).await.unwrap();
    }

    assert_eq!(
        provider.calls(),
        vec!["blocker", "chat", "intervention", "analysis-1", "analysis-2", "requirement"]
    );
    scheduler.shutdown().await;
}

/// Test: cancelling a queued request resolves it as cancelled; a running one cannot be cancelled
#[tokio::test]
async fn test_cancel_queued_and_running() {
    let provider = OrderedProvider::new();
    let scheduler = RequestScheduler::start(provider.clone(), config(1));

    let blocker = scheduler.submit(user("blocker"), PriorityClass::Analysis, params());
    wait_running(&blocker).await;
    let queued = scheduler.submit(user("never sent"), PriorityClass::Analysis, params());

    assert!(scheduler.cancel(&queued));
    assert!(!scheduler.cancel(&queued));
    assert!(!scheduler.cancel(&blocker));
    assert!(matches!(
        queued.wait(Duration::from_secs(1)).await,
        Err(SchedulerError::Cancelled(_))
    ));

    provider.release.notify_one();
    let completion = blocker.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(completion.content, "done: blocker");
    assert_eq!(provider.calls(), vec!["blocker"]);
    assert_eq!(scheduler.stats().cancelled, 1);
}

/// Test: a caller timeout ends only the wait; the result stays observable
#[tokio::test]
async fn test_wait_timeout_then_result() {
    let provider = OrderedProvider::new();
    let scheduler = RequestScheduler::start(provider.clone(), config(1));

    let handle = scheduler.submit(user("blocker"), PriorityClass::Chat, params());
    let err = handle.wait(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Timeout { waited_ms: 20, .. }));

    provider.release.notify_one();
    let completion = handle.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(completion.content, "done: blocker");
    assert!(handle.is_finished());
}

/// Fails with the scripted errors first, then succeeds. Records call times.
struct FlakyProvider {
    failures: Mutex<Vec<ProviderError>>,
    call_times: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait]
impl CompletionProvider for FlakyProvider {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _params: &ModelParams,
    ) -> Result<Completion, ProviderError> {
        self.call_times.lock().unwrap().push(tokio::time::Instant::now());
        let mut failures = self.failures.lock().unwrap();
        if failures.is_empty() {
            Ok(Completion::text("ok"))
        } else {
            Err(failures.remove(0))
        }
    }
}

/// Test: two rate-limit errors then success, retry delay 1s => at least 1s + 2s elapsed
#[tokio::test(start_paused = true)]
async fn test_rate_limited_twice_then_succeeds() {
    let provider = Arc::new(FlakyProvider {
        failures: Mutex::new(vec![
            ProviderError::rate_limited("429 Too Many Requests"),
            ProviderError::rate_limited("429 Too Many Requests"),
        ]),
        call_times: Mutex::new(Vec::new()),
    });
    let scheduler = RequestScheduler::start(
        provider.clone(),
        SchedulerConfig {
            max_concurrent_requests: 1,
            max_retries: 3,
            retry_delay_ms: 1_000,
            ..Default::default()
        },
    );

    let start = tokio::time::Instant::now();
    let completion = scheduler
        .submit_and_wait(user("hi"), PriorityClass::Analysis, params(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(completion.content, "ok");
    assert!(start.elapsed() >= Duration::from_secs(3));

    let times = provider.call_times.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_secs(1));
    assert!(second_gap >= first_gap);

    let stats = scheduler.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.completed, 1);
}

/// Test: a rejected request fails after one attempt
#[tokio::test(start_paused = true)]
async fn test_rejected_is_terminal() {
    let provider = Arc::new(FlakyProvider {
        failures: Mutex::new(vec![ProviderError::rejected("400 invalid model")]),
        call_times: Mutex::new(Vec::new()),
    });
    let scheduler = RequestScheduler::start(provider.clone(), config(1));

    let err = scheduler
        .submit_and_wait(user("hi"), PriorityClass::Chat, params(), Duration::from_secs(60))
        .await
        .unwrap_err();
    match err {
        SchedulerError::Provider(failure) => {
            assert_eq!(failure.attempts, 1);
            assert_eq!(failure.last_cause.kind, ProviderErrorKind::Rejected);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(provider.call_times.lock().unwrap().len(), 1);
    assert_eq!(scheduler.stats().retries, 0);
}

/// Answers analyzer prompts and tracks how many calls overlap.
struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionProvider for ConcurrencyProbe {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _params: &ModelParams,
    ) -> Result<Completion, ProviderError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if messages[0].content == CONSISTENCY_SYSTEM_PROMPT {
            Ok(Completion::text("[]"))
        } else {
            Ok(Completion::text("No"))
        }
    }
}

/// Test: 5 segments updated at once with 2 workers all complete; at most 2 calls overlap
#[tokio::test]
async fn test_five_segments_on_two_workers() {
    let probe = Arc::new(ConcurrencyProbe {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let mut config = CoordinationConfig::default();
    config.scheduler.max_concurrent_requests = 2;
    let (sink, mut rx) = EventSink::channel();
    let session = SurveySession::new(probe.clone(), config, SurveyContext::default(), sink);

    for idx in 0..5u32 {
        session.handle_segment_update(
            SegmentUpdate::new(format!("seg-{idx}"), format!("Reviews should load within {idx} seconds"), 0)
                .with_position(idx),
        );
    }

    let mut completed = 0;
    while completed < 5 {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("analysis did not finish")
            .expect("sink closed");
        assert!(
            matches!(event, OutboundEvent::AnalysisComplete { .. }),
            "unexpected event: {event:?}"
        );
        completed += 1;
    }

    assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    assert!(probe.calls.load(Ordering::SeqCst) >= 5);
    assert!(session.scheduler_stats().peak_in_flight <= 2);
    session.shutdown().await;
}
