//! Requirement generation for one question at a time.
//!
//! Each call to [`RequirementGenerator::generate`] registers a generation id
//! for its question. Just before delivery, under the generator lock, the run
//! checks that it is still the registered generation and that nobody called
//! [`RequirementGenerator::discard`]; otherwise its result is dropped without
//! an outbound event.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::tracker::SharedStabilityTracker;
use crate::analyzers::parse::{parse_json_array, ParseError};
use crate::config::GenerationConfig;
use crate::context::SurveyContext;
use crate::coordinator::types::SegmentId;
use crate::events::{EventSink, OutboundEvent};
use crate::prompts;
use crate::scheduler::{ChatMessage, ModelParams, PriorityClass, RequestScheduler, SchedulerError};

/// What asked for requirements to be generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Manual,
    Stability,
    Timeout,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Stability => write!(f, "stability"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentText {
    pub segment_id: SegmentId,
    pub text: String,
}

impl SegmentText {
    pub fn new(segment_id: impl Into<SegmentId>, text: impl Into<String>) -> Self {
        Self {
            segment_id: segment_id.into(),
            text: text.into(),
        }
    }
}

/// One generated requirement and the segments it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub requirement: String,
    #[serde(default)]
    pub segments: Vec<SegmentId>,
}

/// Error type for requirement generation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("Requirement generation request failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Invalid requirement response: {0}")]
    Parse(#[from] ParseError),
}

impl GenerationError {
    /// Short reason used as the `error` field of the failure event.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Scheduler(SchedulerError::Timeout { .. }) => "generation timed out",
            Self::Scheduler(_) => "completion request failed",
            Self::Parse(_) => "invalid response format",
        }
    }
}

/// Result type for requirement generation
pub type GenerationResult<T> = Result<T, GenerationError>;

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// `requirement_generation_complete` was published.
    Delivered(Vec<Requirement>),
    /// No requirements: the segments were blank or the model returned an
    /// empty list. An empty completion event was published.
    Empty,
    /// Discarded or superseded; nothing was published.
    Discarded,
    /// `requirement_generation_failed` was published.
    Failed(GenerationError),
}

impl GenerationOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_) | Self::Empty)
    }
}

#[derive(Debug)]
struct ActiveGeneration {
    generation_id: u64,
    discarded: bool,
    trigger: TriggerMode,
    segments: usize,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct GenerationState {
    next_id: u64,
    active: HashMap<u32, ActiveGeneration>,
}

fn lock(state: &Mutex<GenerationState>) -> MutexGuard<'_, GenerationState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RequirementGenerator {
    scheduler: RequestScheduler,
    config: GenerationConfig,
    stability: SharedStabilityTracker,
    sink: EventSink,
    state: Mutex<GenerationState>,
}

impl RequirementGenerator {
    pub fn new(
        scheduler: RequestScheduler,
        config: GenerationConfig,
        stability: SharedStabilityTracker,
        sink: EventSink,
    ) -> Self {
        Self {
            scheduler,
            config,
            stability,
            sink,
            state: Mutex::new(GenerationState::default()),
        }
    }

    /// Generate requirements for a question and publish the outcome.
    pub async fn generate(
        &self,
        question_index: u32,
        segments: Vec<SegmentText>,
        trigger: TriggerMode,
        context: &SurveyContext,
    ) -> GenerationOutcome {
        let segments: Vec<SegmentText> = segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .collect();
        let generation_id = self.register(question_index, trigger, segments.len());

        if segments.is_empty() {
            info!(question_index, generation_id, "No segment text to generate requirements from");
            return self.finish(question_index, generation_id, Ok(Vec::new()));
        }

        let result = self.request(question_index, &segments, context).await;
        self.finish(question_index, generation_id, result)
    }

    /// Suppress delivery of the question's running generation.
    ///
    /// Returns `false` when the question has no active generation.
    pub fn discard(&self, question_index: u32) -> bool {
        let mut state = lock(&self.state);
        match state.active.get_mut(&question_index) {
            Some(active) if !active.discarded => {
                active.discarded = true;
                info!(
                    question_index,
                    generation_id = active.generation_id,
                    trigger = %active.trigger,
                    "Generation marked for discard"
                );
                true
            }
            Some(_) => {
                debug!(question_index, "Generation already discarded");
                false
            }
            None => {
                warn!(question_index, "No active generation to discard");
                false
            }
        }
    }

    pub fn is_generating(&self, question_index: u32) -> bool {
        lock(&self.state)
            .active
            .get(&question_index)
            .is_some_and(|a| !a.discarded)
    }

    /// Forget every active generation; their results will be dropped.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        let dropped = state.active.len();
        state.active.clear();
        info!(dropped, "Requirement generator reset");
    }

    fn register(&self, question_index: u32, trigger: TriggerMode, segments: usize) -> u64 {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let generation_id = state.next_id;
        let previous = state.active.insert(
            question_index,
            ActiveGeneration {
                generation_id,
                discarded: false,
                trigger,
                segments,
                started_at: Utc::now(),
            },
        );
        if let Some(previous) = previous {
            info!(
                question_index,
                superseded = previous.generation_id,
                "Superseding running generation"
            );
        }
        info!(question_index, generation_id, %trigger, segments, "Requirement generation started");
        generation_id
    }

    async fn request(
        &self,
        question_index: u32,
        segments: &[SegmentText],
        context: &SurveyContext,
    ) -> GenerationResult<Vec<Requirement>> {
        let question = context.question(question_index);
        let listed: Vec<(String, String)> = segments
            .iter()
            .map(|s| (s.segment_id.to_string(), s.text.clone()))
            .collect();
        let messages = vec![
            ChatMessage::system(prompts::REQUIREMENT_SYSTEM_PROMPT),
            ChatMessage::user(prompts::requirement_prompt(
                &question.text,
                context.system_name(),
                &listed,
            )),
        ];
        let params = ModelParams::new(&self.config.model)
            .max_tokens(self.config.max_tokens)
            .temperature(self.config.temperature);

        let completion = self
            .scheduler
            .submit_and_wait(messages, PriorityClass::Requirement, params, self.config.await_timeout())
            .await?;
        Ok(parse_json_array(&completion.content)?)
    }

    /// Deliver the result if this run is still current for its question.
    fn finish(
        &self,
        question_index: u32,
        generation_id: u64,
        result: GenerationResult<Vec<Requirement>>,
    ) -> GenerationOutcome {
        let mut state = lock(&self.state);
        let current = match state.active.get(&question_index) {
            Some(active) if active.generation_id == generation_id => active,
            _ => {
                info!(question_index, generation_id, "Dropping superseded generation result");
                return GenerationOutcome::Discarded;
            }
        };
        let discarded = current.discarded;
        let elapsed_ms = (Utc::now() - current.started_at).num_milliseconds();
        state.active.remove(&question_index);
        if discarded {
            info!(question_index, generation_id, "Generation discarded before delivery");
            return GenerationOutcome::Discarded;
        }

        match result {
            Ok(requirements) => {
                let count = requirements.len();
                self.stability
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear_question(question_index);
                if let Err(e) = self.sink.publish(OutboundEvent::RequirementGenerationComplete {
                    question_index,
                    requirements: requirements.clone(),
                    timestamp: Utc::now(),
                }) {
                    debug!(error = %e, "Outbound event not delivered");
                }
                info!(question_index, generation_id, requirements = count, elapsed_ms, "Requirement generation complete");
                if count == 0 {
                    GenerationOutcome::Empty
                } else {
                    GenerationOutcome::Delivered(requirements)
                }
            }
            Err(err) => {
                warn!(question_index, generation_id, error = %err, "Requirement generation failed");
                if let Err(e) = self.sink.publish(OutboundEvent::RequirementGenerationFailed {
                    question_index,
                    error: err.reason().to_string(),
                    details: Some(err.to_string()),
                    timestamp: Utc::now(),
                }) {
                    debug!(error = %e, "Outbound event not delivered");
                }
                GenerationOutcome::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::{Completion, CompletionProvider, ProviderError};
    use crate::stability::StabilityTracker;

    const TWO_REQUIREMENTS: &str = r#"```json
[{"requirement": "The system shall show reviews.", "segments": ["a", "b"]},
 {"requirement": "When a review is posted, the system shall notify the lecturer.", "segments": ["c"]}]
```"#;

    /// Replies once `release` is notified.
    struct GatedReply {
        reply: &'static str,
        release: Arc<Notify>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionProvider for GatedReply {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            params: &ModelParams,
        ) -> Result<Completion, ProviderError> {
            assert_eq!(params.max_tokens, Some(2_000));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(Completion::text(self.reply))
        }
    }

    struct Fixture {
        generator: Arc<RequirementGenerator>,
        stability: SharedStabilityTracker,
        release: Arc<Notify>,
        provider: Arc<GatedReply>,
        rx: crate::events::EventReceiver,
    }

    fn fixture(reply: &'static str) -> Fixture {
        let release = Arc::new(Notify::new());
        let provider = Arc::new(GatedReply {
            reply,
            release: release.clone(),
            calls: AtomicUsize::new(0),
        });
        let scheduler = RequestScheduler::start(provider.clone(), SchedulerConfig::default());
        let stability = StabilityTracker::default().shared();
        let (sink, rx) = EventSink::channel();
        let generator = Arc::new(RequirementGenerator::new(
            scheduler,
            GenerationConfig::default(),
            stability.clone(),
            sink,
        ));
        Fixture {
            generator,
            stability,
            release,
            provider,
            rx,
        }
    }

    fn segments() -> Vec<SegmentText> {
        vec![
            SegmentText::new("a", "Students see reviews"),
            SegmentText::new("b", "   "),
            SegmentText::new("c", "Lecturers get notified"),
        ]
    }

    #[tokio::test]
    async fn test_delivers_and_clears_question() {
        let mut f = fixture(TWO_REQUIREMENTS);
        {
            let mut tracker = f.stability.lock().unwrap();
            tracker.record_update(&"a".into(), "Students see reviews", 4, 0);
            tracker.record_update(&"a".into(), "Students see all reviews", 4, 0);
        }
        f.release.notify_one();

        let outcome = f
            .generator
            .generate(4, segments(), TriggerMode::Manual, &SurveyContext::default())
            .await;
        match outcome {
            GenerationOutcome::Delivered(reqs) => {
                assert_eq!(reqs.len(), 2);
                assert_eq!(reqs[0].segments, vec![SegmentId::from("a"), SegmentId::from("b")]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let event = f.rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "requirement_generation_complete");
        assert_eq!(event.question_index(), Some(4));
        let tracker = f.stability.lock().unwrap();
        assert!(tracker.history(4, &"a".into()).is_empty());
        assert!(tracker.question_segments(4).is_empty());
        assert!(!f.generator.is_generating(4));
    }

    #[tokio::test]
    async fn test_blank_segments_complete_empty_without_provider_call() {
        let mut f = fixture(TWO_REQUIREMENTS);
        let outcome = f
            .generator
            .generate(1, vec![SegmentText::new("x", "  ")], TriggerMode::Timeout, &SurveyContext::default())
            .await;
        assert_eq!(outcome, GenerationOutcome::Empty);
        assert!(outcome.is_delivered());
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 0);

        match f.rx.recv().await.unwrap() {
            OutboundEvent::RequirementGenerationComplete { requirements, .. } => assert!(requirements.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_model_list_completes_empty() {
        let mut f = fixture("[]");
        f.release.notify_one();
        let outcome = f
            .generator
            .generate(5, segments(), TriggerMode::Manual, &SurveyContext::default())
            .await;
        assert_eq!(outcome, GenerationOutcome::Empty);
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 1);
        match f.rx.recv().await.unwrap() {
            OutboundEvent::RequirementGenerationComplete { requirements, .. } => assert!(requirements.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_sink_still_reports_outcome() {
        let f = fixture(TWO_REQUIREMENTS);
        drop(f.rx);
        f.release.notify_one();
        let outcome = f
            .generator
            .generate(6, segments(), TriggerMode::Manual, &SurveyContext::default())
            .await;
        assert!(matches!(outcome, GenerationOutcome::Delivered(ref reqs) if reqs.len() == 2));
        assert!(!f.generator.is_generating(6));
    }

    #[tokio::test]
    async fn test_discard_mid_flight_suppresses_delivery() {
        let mut f = fixture(TWO_REQUIREMENTS);
        let generator = f.generator.clone();
        let task = tokio::spawn(async move {
            generator
                .generate(2, segments(), TriggerMode::Stability, &SurveyContext::default())
                .await
        });

        while f.provider.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(f.generator.is_generating(2));
        assert!(f.generator.discard(2));
        assert!(!f.generator.discard(2));
        f.release.notify_one();

        assert_eq!(task.await.unwrap(), GenerationOutcome::Discarded);
        assert!(f.rx.try_recv().is_err());
        assert!(!f.generator.is_generating(2));
    }

    #[tokio::test]
    async fn test_discard_without_generation_returns_false() {
        let f = fixture(TWO_REQUIREMENTS);
        assert!(!f.generator.discard(7));
    }

    #[tokio::test]
    async fn test_malformed_response_publishes_failure() {
        let mut f = fixture("Here are some requirements: none");
        f.release.notify_one();
        let outcome = f
            .generator
            .generate(3, segments(), TriggerMode::Manual, &SurveyContext::default())
            .await;
        assert!(matches!(outcome, GenerationOutcome::Failed(GenerationError::Parse(_))));

        match f.rx.recv().await.unwrap() {
            OutboundEvent::RequirementGenerationFailed { error, details, .. } => {
                assert_eq!(error, "invalid response format");
                assert!(details.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_trigger_mode_defaults_to_manual() {
        assert_eq!(TriggerMode::default(), TriggerMode::Manual);
        let parsed: TriggerMode = serde_json::from_str(r#""timeout""#).unwrap();
        assert_eq!(parsed, TriggerMode::Timeout);
    }
}
