//! Analysis coordinator
//!
//! Accepts segment updates, supersedes stale work, fans each surviving
//! request out to the ambiguity and consistency analyzers, and publishes
//! exactly one result per authoritative segment version.
//!
//! # Lifecycle per segment
//!
//! ```text
//!            handle_update                 dispatch
//!  Idle ───────────────────▶ Queued ─────────────────▶ Processing ──┬──▶ Delivered
//!                              │  ▲                        │        │
//!            newer update:     │  │ newer update:          │        └──▶ Held (paused)
//!            removed from queue└──┘ key added to discard   ▼
//!                                                      Discarded (silent)
//! ```
//!
//! Every accepted update gets a fresh monotonic version; a run is identified
//! by its [`RequestKey`] `(segment_id, version)`. The discard set holds keys,
//! so several superseded runs of one segment can be in flight while only the
//! latest is authoritative.
//!
//! # Delivery rule
//!
//! A result is published only if, at the moment of publication, its key is
//! not in the discard set. The check, the consistency-staleness filter and
//! the publish all happen under the state lock, so a concurrent
//! `handle_update` either lands before (and the result is discarded) or
//! after (and the result was legitimately current when sent).

pub mod types;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::analyzers::{
    AmbiguityDetector, AmbiguityResult, AnalyzerResult, ConsistencyChecker, ConsistencyResult,
};
use crate::context::SurveyContext;
use crate::events::{EventSink, OutboundEvent};

pub use types::{
    AnalysisRequest, CoordinatorStats, InterventionCandidate, RequestKey, SegmentId, SegmentInput,
    SegmentPhase, SegmentSnapshot, SegmentUpdate,
};
use types::SegmentRecord;

/// Shared reference to AnalysisCoordinator
pub type SharedAnalysisCoordinator = Arc<AnalysisCoordinator>;

/// A finished result waiting for `resume()`.
#[derive(Debug)]
struct HeldResult {
    key: RequestKey,
    event: OutboundEvent,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    next_version: u64,
    /// Latest accepted update per segment.
    records: HashMap<SegmentId, SegmentRecord>,
    /// Not yet dispatched; at most one entry per segment.
    queue: VecDeque<AnalysisRequest>,
    /// Every dispatched run that has not finished, superseded or not.
    processing: HashSet<RequestKey>,
    /// Runs whose results must be dropped on completion.
    discard: HashSet<RequestKey>,
    paused: bool,
    /// Results finished while paused, in completion order.
    held: Vec<HeldResult>,
    stats: CoordinatorStats,
}

impl CoordinatorState {
    /// Whether `segment_id` has queued or authoritative processing work
    /// newer than `version`.
    fn has_newer_pending(&self, segment_id: &SegmentId, version: u64) -> bool {
        self.queue
            .iter()
            .any(|r| &r.key.segment_id == segment_id && r.key.version > version)
            || self.processing.iter().any(|k| {
                &k.segment_id == segment_id && k.version > version && !self.discard.contains(k)
            })
    }

    /// Segments visible to the consistency check. When the caller sends its
    /// segment list, that list decides membership and recorded text and
    /// versions only refresh its entries; otherwise every record is used.
    fn snapshot(&self, all_segments: &[SegmentInput]) -> Vec<SegmentSnapshot> {
        let supplied = !all_segments.is_empty();
        let mut merged: BTreeMap<&SegmentId, SegmentSnapshot> = all_segments
            .iter()
            .map(|s| {
                (
                    &s.segment_id,
                    SegmentSnapshot {
                        segment_id: s.segment_id.clone(),
                        text: s.text.clone(),
                        question_index: s.question_index,
                        position_index: s.position_index,
                        version: 0,
                    },
                )
            })
            .collect();
        for (id, record) in &self.records {
            if supplied && !merged.contains_key(id) {
                continue;
            }
            merged.insert(
                id,
                SegmentSnapshot {
                    segment_id: id.clone(),
                    text: record.text.clone(),
                    question_index: record.question_index,
                    position_index: record.position_index,
                    version: record.version,
                },
            );
        }
        merged.into_values().collect()
    }
}

struct CoordinatorInner {
    detector: Arc<dyn AmbiguityDetector>,
    checker: Arc<dyn ConsistencyChecker>,
    sink: EventSink,
    state: Mutex<CoordinatorState>,
    wake: Notify,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

// No critical section can panic midway; recover the guard instead of propagating poison.
fn lock(state: &Mutex<CoordinatorState>) -> MutexGuard<'_, CoordinatorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Merge analyzer outputs into intervention candidates.
pub fn build_candidates(
    ambiguity: AmbiguityResult,
    consistency: ConsistencyResult,
    current_text: &str,
) -> Vec<InterventionCandidate> {
    let mut candidates = Vec::with_capacity(1 + consistency.contradictions.len());
    if ambiguity.is_ambiguous {
        candidates.push(InterventionCandidate::Ambiguity {
            style: ambiguity.style,
            confidence: ambiguity.confidence,
            trigger_phrase: ambiguity.trigger_phrase,
            suggestions: ambiguity.suggestions,
        });
    }
    for contradiction in consistency.contradictions {
        candidates.push(InterventionCandidate::Consistency {
            confidence: contradiction.score,
            previous_segment_id: contradiction.previous_segment_id,
            previous_text: contradiction.previous_text,
            current_text: current_text.to_string(),
            previous_version: contradiction.previous_version,
        });
    }
    candidates
}

/// Per-segment most-recent-wins analysis pipeline.
///
/// Cloning is cheap; clones share state and the dispatch loop.
#[derive(Clone)]
pub struct AnalysisCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl AnalysisCoordinator {
    /// Start the dispatch loop on the current Tokio runtime.
    pub fn start(
        detector: Arc<dyn AmbiguityDetector>,
        checker: Arc<dyn ConsistencyChecker>,
        sink: EventSink,
    ) -> Self {
        let inner = Arc::new(CoordinatorInner {
            detector,
            checker,
            sink,
            state: Mutex::new(CoordinatorState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        let dispatcher = inner.clone();
        inner.tasks.spawn(async move { dispatcher.dispatch_loop().await });
        Self { inner }
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedAnalysisCoordinator {
        Arc::new(self)
    }

    /// Accept an update, superseding any queued, processing or held work
    /// for the same segment.
    pub fn handle_update(&self, update: SegmentUpdate, context: Arc<SurveyContext>) -> RequestKey {
        let key = {
            let mut state = lock(&self.inner.state);
            state.next_version += 1;
            let key = RequestKey {
                segment_id: update.segment_id.clone(),
                version: state.next_version,
            };

            let before = state.queue.len();
            state.queue.retain(|r| r.key.segment_id != key.segment_id);
            if state.queue.len() < before {
                info!(segment_id = %key.segment_id, "Removed superseded queued analysis");
            }

            let superseded: Vec<RequestKey> = state
                .processing
                .iter()
                .filter(|k| k.segment_id == key.segment_id && !state.discard.contains(*k))
                .cloned()
                .collect();
            for stale in superseded {
                info!(segment_id = %stale.segment_id, version = stale.version, "Marking in-flight analysis for discard");
                state.discard.insert(stale);
            }

            let held_before = state.held.len();
            state.held.retain(|h| h.key.segment_id != key.segment_id);
            let dropped = held_before - state.held.len();
            if dropped > 0 {
                state.stats.discarded += dropped as u64;
                info!(segment_id = %key.segment_id, "Dropped held result superseded during pause");
            }

            state.records.insert(
                key.segment_id.clone(),
                SegmentRecord {
                    text: update.text.clone(),
                    question_index: update.question_index,
                    position_index: update.position_index,
                    version: key.version,
                },
            );
            let snapshot = state.snapshot(&update.all_segments);

            state.queue.push_back(AnalysisRequest {
                key: key.clone(),
                text: update.text,
                question_index: update.question_index,
                position_index: update.position_index,
                submitted_at: Utc::now(),
                snapshot,
                context,
            });
            state.stats.accepted += 1;
            debug!(
                segment_id = %key.segment_id,
                version = key.version,
                queued = state.queue.len(),
                "Analysis queued"
            );
            key
        };

        if self.inner.shutdown.is_cancelled() {
            warn!(segment_id = %key.segment_id, "Update accepted after shutdown, it will not be analyzed");
        }
        self.inner.wake.notify_one();
        key
    }

    /// Stop dispatching new work. Results of running work are held.
    pub fn pause(&self) {
        let mut state = lock(&self.inner.state);
        if state.paused {
            debug!("Analysis already paused");
            return;
        }
        state.paused = true;
        info!(queued = state.queue.len(), "Analysis paused");
    }

    /// Deliver held results in completion order and restart dispatching.
    pub fn resume(&self) {
        {
            let mut state = lock(&self.inner.state);
            if !state.paused {
                debug!("Analysis not paused");
                return;
            }
            state.paused = false;
            let held = std::mem::take(&mut state.held);
            info!(held = held.len(), queued = state.queue.len(), "Analysis resumed");
            for result in held {
                debug!(segment_id = %result.key.segment_id, version = result.key.version, "Delivering held result");
                self.inner.deliver(&mut state, result.event);
            }
        }
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.inner.state).paused
    }

    /// Drop queued work, discard running work, clear held results and
    /// segment records. Versions keep increasing across resets.
    pub fn reset(&self) {
        let mut state = lock(&self.inner.state);
        let queued = state.queue.len();
        state.queue.clear();
        let running: Vec<RequestKey> = state.processing.iter().cloned().collect();
        let discarded = running.len();
        state.discard.extend(running);
        state.held.clear();
        state.records.clear();
        state.paused = false;
        info!(queued, discarded, "Analysis coordinator reset");
    }

    /// Forget the recorded segments of one question so they no longer
    /// appear in consistency snapshots.
    pub fn forget_question(&self, question_index: u32) {
        let mut state = lock(&self.inner.state);
        let before = state.records.len();
        state.records.retain(|_, r| r.question_index != question_index);
        debug!(question_index, removed = before - state.records.len(), "Forgot question segments");
    }

    pub fn segment_phase(&self, segment_id: &SegmentId) -> SegmentPhase {
        let state = lock(&self.inner.state);
        if state.queue.iter().any(|r| &r.key.segment_id == segment_id) {
            SegmentPhase::Queued
        } else if state
            .processing
            .iter()
            .any(|k| &k.segment_id == segment_id && !state.discard.contains(k))
        {
            SegmentPhase::Processing
        } else {
            SegmentPhase::Idle
        }
    }

    /// Version of the latest accepted update for a segment.
    pub fn latest_version(&self, segment_id: &SegmentId) -> Option<u64> {
        lock(&self.inner.state).records.get(segment_id).map(|r| r.version)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = lock(&self.inner.state);
        CoordinatorStats {
            held: state.held.len(),
            ..state.stats
        }
    }

    /// Dispatch whatever is still queued (unless paused), stop the dispatch
    /// loop and wait for every running analysis to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Analysis coordinator shut down");
    }
}

impl CoordinatorInner {
    async fn dispatch_loop(self: Arc<Self>) {
        debug!("Analysis dispatch loop started");
        loop {
            let notified = self.wake.notified();
            while let Some(request) = self.next_request() {
                let worker = self.clone();
                self.tasks.spawn(async move { worker.process(request).await });
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {}
                _ = notified => {}
            }
        }
        let state = lock(&self.state);
        if !state.queue.is_empty() || !state.held.is_empty() {
            warn!(
                queued = state.queue.len(),
                held = state.held.len(),
                "Dispatch loop stopped while paused, pending analyses dropped"
            );
        }
        debug!("Analysis dispatch loop stopped");
    }

    fn next_request(&self) -> Option<AnalysisRequest> {
        let mut state = lock(&self.state);
        if state.paused {
            return None;
        }
        let request = state.queue.pop_front()?;
        state.processing.insert(request.key.clone());
        state.stats.dispatched += 1;
        info!(
            segment_id = %request.key.segment_id,
            version = request.key.version,
            in_flight = state.processing.len(),
            "Analysis dispatched"
        );
        Some(request)
    }

    async fn process(self: Arc<Self>, request: AnalysisRequest) {
        let outcome = AssertUnwindSafe(self.analyze(&request))
            .catch_unwind()
            .await;
        let outcome = match outcome {
            Ok(Ok(candidates)) => Ok(candidates),
            Ok(Err(err)) => Err(err.to_string()),
            Err(payload) => {
                error!(
                    segment_id = %request.key.segment_id,
                    version = request.key.version,
                    "Analysis panicked"
                );
                Err(format!("analysis panicked: {}", panic_message(payload.as_ref())))
            }
        };
        self.complete(request.key, outcome);
    }

    async fn analyze(&self, request: &AnalysisRequest) -> AnalyzerResult<Vec<InterventionCandidate>> {
        let question = request.context.question(request.question_index);
        let current = request.current();
        let prior = request.prior_segments();
        debug!(
            segment_id = %request.key.segment_id,
            version = request.key.version,
            prior = prior.len(),
            "Running ambiguity and consistency analysis"
        );

        let (ambiguity, consistency) = tokio::join!(
            self.detector.detect(&request.text, &question),
            self.checker.check(&current, &prior, &request.context),
        );
        Ok(build_candidates(ambiguity?, consistency?, &request.text))
    }

    fn complete(&self, key: RequestKey, outcome: Result<Vec<InterventionCandidate>, String>) {
        let mut state = lock(&self.state);
        state.processing.remove(&key);

        if state.discard.remove(&key) {
            state.stats.discarded += 1;
            info!(segment_id = %key.segment_id, version = key.version, "Discarding superseded analysis");
            return;
        }

        let event = match outcome {
            Ok(candidates) => {
                let total = candidates.len();
                let kept: Vec<InterventionCandidate> = candidates
                    .into_iter()
                    .filter(|c| match c.referenced_segment() {
                        Some((referenced, version)) => !state.has_newer_pending(referenced, version),
                        None => true,
                    })
                    .collect();
                if kept.len() < total {
                    info!(
                        segment_id = %key.segment_id,
                        dropped = total - kept.len(),
                        "Dropped consistency interventions referencing segments with newer pending analysis"
                    );
                }
                OutboundEvent::analysis_complete(&key, kept)
            }
            Err(err) => {
                warn!(segment_id = %key.segment_id, version = key.version, error = %err, "Analysis failed");
                OutboundEvent::analysis_error(&key, err)
            }
        };

        if state.paused {
            debug!(segment_id = %key.segment_id, version = key.version, "Holding result while paused");
            state.held.push(HeldResult { key, event });
            return;
        }
        self.deliver(&mut state, event);
    }

    /// Publish while the caller holds the state lock.
    fn deliver(&self, state: &mut CoordinatorState, event: OutboundEvent) {
        let is_error = matches!(event, OutboundEvent::AnalysisError { .. });
        if self.sink.publish(event).is_err() {
            return;
        }
        if is_error {
            state.stats.errors += 1;
        } else {
            state.stats.delivered += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::analyzers::{AnalyzerError, Contradiction, InterventionStyle};
    use crate::context::QuestionContext;

    struct NeverAmbiguous;

    #[async_trait]
    impl AmbiguityDetector for NeverAmbiguous {
        async fn detect(&self, _text: &str, _question: &QuestionContext) -> AnalyzerResult<AmbiguityResult> {
            Ok(AmbiguityResult::clear(0.9))
        }
    }

    struct Consistent;

    #[async_trait]
    impl ConsistencyChecker for Consistent {
        async fn check(
            &self,
            _current: &SegmentSnapshot,
            _prior: &[SegmentSnapshot],
            _context: &SurveyContext,
        ) -> AnalyzerResult<ConsistencyResult> {
            Ok(ConsistencyResult::default())
        }
    }

    struct FailingChecker;

    #[async_trait]
    impl ConsistencyChecker for FailingChecker {
        async fn check(
            &self,
            _current: &SegmentSnapshot,
            _prior: &[SegmentSnapshot],
            _context: &SurveyContext,
        ) -> AnalyzerResult<ConsistencyResult> {
            Err(AnalyzerError::Internal("checker offline".into()))
        }
    }

    struct PanickingDetector;

    #[async_trait]
    impl AmbiguityDetector for PanickingDetector {
        async fn detect(&self, text: &str, _question: &QuestionContext) -> AnalyzerResult<AmbiguityResult> {
            if text == "boom" {
                panic!("detector exploded");
            }
            Ok(AmbiguityResult::clear(1.0))
        }
    }

    fn context() -> Arc<SurveyContext> {
        Arc::new(SurveyContext::default())
    }

    #[test]
    fn test_build_candidates() {
        let ambiguity = AmbiguityResult {
            is_ambiguous: true,
            confidence: 0.8,
            trigger_phrase: Some("quickly".into()),
            suggestions: vec!["fast".into()],
            style: Some(InterventionStyle::MultipleChoice),
        };
        let consistency = ConsistencyResult {
            contradictions: vec![Contradiction {
                previous_segment_id: "b".into(),
                previous_text: "slowly".into(),
                previous_version: 3,
                score: 0.97,
            }],
        };
        let candidates = build_candidates(ambiguity, consistency, "quickly");
        assert_eq!(candidates.len(), 2);
        assert!(matches!(candidates[0], InterventionCandidate::Ambiguity { .. }));
        assert_eq!(candidates[1].referenced_segment(), Some((&SegmentId::from("b"), 3)));

        assert!(build_candidates(AmbiguityResult::clear(0.9), ConsistencyResult::default(), "x").is_empty());
    }

    #[test]
    fn test_newer_pending_ignores_discarded_runs() {
        let mut state = CoordinatorState::default();
        let old = RequestKey {
            segment_id: "b".into(),
            version: 5,
        };
        state.processing.insert(old.clone());
        assert!(state.has_newer_pending(&"b".into(), 2));
        assert!(!state.has_newer_pending(&"b".into(), 5));

        state.discard.insert(old);
        assert!(!state.has_newer_pending(&"b".into(), 2));
    }

    #[test]
    fn test_snapshot_prefers_recorded_versions() {
        let mut state = CoordinatorState::default();
        state.records.insert(
            "a".into(),
            SegmentRecord {
                text: "recorded".into(),
                question_index: 0,
                position_index: 0,
                version: 7,
            },
        );
        let supplied = vec![
            SegmentInput {
                segment_id: "a".into(),
                text: "client copy".into(),
                question_index: 0,
                position_index: 0,
            },
            SegmentInput {
                segment_id: "z".into(),
                text: "unseen".into(),
                question_index: 1,
                position_index: 2,
            },
        ];
        let snapshot = state.snapshot(&supplied);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].text, "recorded");
        assert_eq!(snapshot[0].version, 7);
        assert_eq!(snapshot[1].version, 0);
    }

    #[test]
    fn test_snapshot_skips_records_missing_from_supplied_list() {
        let mut state = CoordinatorState::default();
        for (id, version) in [("a", 1), ("b", 2)] {
            state.records.insert(
                id.into(),
                SegmentRecord {
                    text: format!("text {id}"),
                    question_index: 0,
                    position_index: 0,
                    version,
                },
            );
        }
        let supplied = vec![SegmentInput {
            segment_id: "a".into(),
            text: "client copy".into(),
            question_index: 0,
            position_index: 0,
        }];
        let snapshot = state.snapshot(&supplied);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].segment_id, SegmentId::from("a"));
        assert_eq!(snapshot[0].version, 1);

        assert_eq!(state.snapshot(&[]).len(), 2);
    }

    #[tokio::test]
    async fn test_delivers_result_for_single_update() {
        let (sink, mut rx) = EventSink::channel();
        let coordinator = AnalysisCoordinator::start(Arc::new(NeverAmbiguous), Arc::new(Consistent), sink);

        let key = coordinator.handle_update(SegmentUpdate::new("s1", "Reviews load in 1s", 0), context());
        let event = rx.recv().await.unwrap();
        match event {
            OutboundEvent::AnalysisComplete {
                segment_id,
                version,
                interventions,
                ..
            } => {
                assert_eq!(segment_id, key.segment_id);
                assert_eq!(version, key.version);
                assert!(interventions.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(coordinator.segment_phase(&"s1".into()), SegmentPhase::Idle);
        assert_eq!(coordinator.stats().delivered, 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_analyzer_error_becomes_analysis_error() {
        let (sink, mut rx) = EventSink::channel();
        let coordinator = AnalysisCoordinator::start(Arc::new(NeverAmbiguous), Arc::new(FailingChecker), sink);

        coordinator.handle_update(SegmentUpdate::new("s1", "text", 0), context());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, OutboundEvent::AnalysisError { ref error, .. } if error.contains("checker offline")));
        assert_eq!(coordinator.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_panic_is_isolated_to_its_segment() {
        let (sink, mut rx) = EventSink::channel();
        let coordinator = AnalysisCoordinator::start(Arc::new(PanickingDetector), Arc::new(Consistent), sink);

        coordinator.handle_update(SegmentUpdate::new("bad", "boom", 0), context());
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, OutboundEvent::AnalysisError { ref error, .. } if error.contains("detector exploded")));

        coordinator.handle_update(SegmentUpdate::new("good", "fine", 0), context());
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, OutboundEvent::AnalysisComplete { ref segment_id, .. } if segment_id.as_str() == "good"));
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let (sink, _rx) = EventSink::channel();
        let coordinator = AnalysisCoordinator::start(Arc::new(NeverAmbiguous), Arc::new(Consistent), sink);
        coordinator.pause();
        coordinator.pause();
        assert!(coordinator.is_paused());
        coordinator.resume();
        assert!(!coordinator.is_paused());
        coordinator.resume();
        assert!(!coordinator.is_paused());
    }

    #[tokio::test]
    async fn test_queued_update_replaced_while_paused() {
        let (sink, mut rx) = EventSink::channel();
        let coordinator = AnalysisCoordinator::start(Arc::new(NeverAmbiguous), Arc::new(Consistent), sink);
        coordinator.pause();

        coordinator.handle_update(SegmentUpdate::new("s1", "first", 0), context());
        let latest = coordinator.handle_update(SegmentUpdate::new("s1", "second", 0), context());
        assert_eq!(coordinator.segment_phase(&"s1".into()), SegmentPhase::Queued);
        assert_eq!(coordinator.latest_version(&"s1".into()), Some(latest.version));

        coordinator.resume();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, OutboundEvent::AnalysisComplete { version, .. } if version == latest.version));
        assert_eq!(coordinator.stats().dispatched, 1);
    }
}
