//! Survey session facade
//!
//! One [`SurveySession`] per editing session. It owns the request scheduler,
//! the analysis coordinator, the stability tracker and the requirement
//! generator, plus the active [`SurveyContext`], and routes
//! [`InboundEvent`]s from the transport layer to them. Every result leaves
//! through the session's [`EventSink`].
//!
//! | Operation                 | Component                         | Outbound event(s)                          |
//! |---------------------------|-----------------------------------|--------------------------------------------|
//! | `handle_segment_update`   | stability tracker, coordinator    | `analysis_complete` / `analysis_error`     |
//! | `pause_analysis` / `resume_analysis` | coordinator            | held results on resume                     |
//! | `get_question_stability`  | stability tracker                 | `stability_response`                       |
//! | `generate_requirements`   | generator                         | `requirement_generation_*`                 |
//! | `discard_generation`      | generator                         | none                                       |
//! | `chat`                    | scheduler (`Chat` priority)       | `chat_reply` / `chat_failed`               |
//! | `reset_state`             | all                               | none                                       |

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::analyzers::{
    AmbiguityDetector, ConsistencyChecker, LlmAmbiguityDetector, LlmConsistencyChecker,
};
use crate::config::CoordinationConfig;
use crate::context::{ContextCatalog, SurveyContext};
use crate::coordinator::{AnalysisCoordinator, CoordinatorStats, RequestKey, SegmentUpdate};
use crate::events::{EventSink, InboundEvent, OutboundEvent};
use crate::prompts;
use crate::scheduler::{
    ChatMessage, CompletionProvider, ModelParams, PriorityClass, RequestScheduler,
    SchedulerResult, SchedulerStats,
};
use crate::stability::{
    GenerationOutcome, QuestionStability, RequirementGenerator, SegmentText,
    SharedStabilityTracker, StabilityTracker, TriggerMode,
};

/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SurveySession {
    config: Arc<CoordinationConfig>,
    scheduler: RequestScheduler,
    coordinator: AnalysisCoordinator,
    stability: SharedStabilityTracker,
    generator: Arc<RequirementGenerator>,
    sink: EventSink,
    context: Arc<RwLock<Arc<SurveyContext>>>,
    catalog: Arc<ContextCatalog>,
    tasks: TaskTracker,
}

impl SurveySession {
    /// Start a session backed by the LLM analyzers.
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        config: CoordinationConfig,
        context: SurveyContext,
        sink: EventSink,
    ) -> Self {
        let scheduler = RequestScheduler::start(provider, config.scheduler.clone());
        let detector = Arc::new(LlmAmbiguityDetector::new(scheduler.clone(), config.analysis.clone()));
        let checker = Arc::new(LlmConsistencyChecker::new(scheduler.clone(), config.analysis.clone()));
        Self::with_analyzers(scheduler, detector, checker, config, context, sink)
    }

    /// Start a session with caller-supplied analyzers on an existing scheduler.
    pub fn with_analyzers(
        scheduler: RequestScheduler,
        detector: Arc<dyn AmbiguityDetector>,
        checker: Arc<dyn ConsistencyChecker>,
        config: CoordinationConfig,
        context: SurveyContext,
        sink: EventSink,
    ) -> Self {
        let coordinator = AnalysisCoordinator::start(detector, checker, sink.clone());
        let stability = StabilityTracker::new(config.stability.clone()).shared();
        let generator = Arc::new(RequirementGenerator::new(
            scheduler.clone(),
            config.generation.clone(),
            stability.clone(),
            sink.clone(),
        ));
        info!(
            system = %context.system_name(),
            questions = context.questions.len(),
            workers = config.scheduler.max_concurrent_requests,
            "Survey session started"
        );
        Self {
            config: Arc::new(config),
            scheduler,
            coordinator,
            stability,
            generator,
            sink,
            context: Arc::new(RwLock::new(Arc::new(context))),
            catalog: Arc::new(ContextCatalog::default()),
            tasks: TaskTracker::new(),
        }
    }

    /// Contexts that `reset_session` events may select by id.
    pub fn with_catalog(mut self, catalog: ContextCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn context(&self) -> Arc<SurveyContext> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &AnalysisCoordinator {
        &self.coordinator
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    /// Record the edit for stability tracking and queue it for analysis.
    pub fn handle_segment_update(&self, update: SegmentUpdate) -> RequestKey {
        self.stability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_update(
                &update.segment_id,
                &update.text,
                update.question_index,
                update.position_index,
            );
        self.coordinator.handle_update(update, self.context())
    }

    pub fn pause_analysis(&self) {
        self.coordinator.pause();
    }

    pub fn resume_analysis(&self) {
        self.coordinator.resume();
    }

    /// Classify the question's segments and publish a `stability_response`.
    pub fn get_question_stability(&self, question_index: u32) -> QuestionStability {
        let stability = self
            .stability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .question_stability(question_index);
        debug!(
            question_index,
            is_stable = stability.is_stable,
            segments = stability.segments.len(),
            "Question stability checked"
        );
        if let Err(e) = self.sink.publish(OutboundEvent::StabilityResponse {
            question_index,
            is_stable: stability.is_stable,
            segments: stability.segments.clone(),
            timestamp: Utc::now(),
        }) {
            debug!(error = %e, "Outbound event not delivered");
        }
        stability
    }

    /// Generate requirements for a question. On delivery the question's
    /// segments are also dropped from future consistency snapshots.
    pub async fn generate_requirements(
        &self,
        question_index: u32,
        segments: Vec<SegmentText>,
        trigger: TriggerMode,
    ) -> GenerationOutcome {
        let context = self.context();
        let outcome = self
            .generator
            .generate(question_index, segments, trigger, &context)
            .await;
        if outcome.is_delivered() {
            self.coordinator.forget_question(question_index);
        }
        outcome
    }

    pub fn discard_generation(&self, question_index: u32) -> bool {
        self.generator.discard(question_index)
    }

    /// Ask the survey assistant; the reply is also published.
    pub async fn chat(&self, history: Vec<ChatMessage>, message: String) -> SchedulerResult<String> {
        let context = self.context();
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(prompts::chat_system_prompt(&context)));
        messages.extend(history);
        messages.push(ChatMessage::user(message));

        let params = ModelParams::new(&self.config.analysis.model);
        let result = self
            .scheduler
            .submit_and_wait(
                messages,
                PriorityClass::Chat,
                params,
                self.config.scheduler.default_await_timeout(),
            )
            .await;

        match result {
            Ok(completion) => {
                if let Err(e) = self.sink.publish(OutboundEvent::ChatReply {
                    content: completion.content.clone(),
                    timestamp: Utc::now(),
                }) {
                    debug!(error = %e, "Outbound event not delivered");
                }
                Ok(completion.content)
            }
            Err(err) => {
                warn!(error = %err, "Chat request failed");
                if let Err(e) = self.sink.publish(OutboundEvent::ChatFailed {
                    error: err.to_string(),
                    timestamp: Utc::now(),
                }) {
                    debug!(error = %e, "Outbound event not delivered");
                }
                Err(err)
            }
        }
    }

    /// Clear analysis, stability and generation state, optionally switching
    /// to a new survey context.
    pub fn reset_state(&self, context: Option<SurveyContext>) {
        self.coordinator.reset();
        self.stability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.generator.reset();
        if let Some(context) = context {
            info!(system = %context.system_name(), questions = context.questions.len(), "Survey context replaced");
            *self.context.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(context);
        }
        info!("Session state reset");
    }

    /// Route one transport event. Generation and chat run as session tasks.
    pub fn handle_inbound(&self, event: InboundEvent) {
        debug!(event_type = event.event_type(), "Inbound event received");
        match event {
            InboundEvent::SegmentUpdate {
                segment_id,
                text,
                question_index,
                position_index,
                all_segments,
            } => {
                self.handle_segment_update(SegmentUpdate {
                    segment_id,
                    text,
                    question_index,
                    position_index,
                    all_segments,
                });
            }
            InboundEvent::PauseAnalysis => self.pause_analysis(),
            InboundEvent::ResumeAnalysis => self.resume_analysis(),
            InboundEvent::StabilityCheck { question_index } => {
                self.get_question_stability(question_index);
            }
            InboundEvent::GenerateRequirements {
                question_index,
                segments,
                trigger_mode,
            } => {
                let session = self.clone();
                self.tasks.spawn(async move {
                    session
                        .generate_requirements(question_index, segments, trigger_mode)
                        .await;
                });
            }
            InboundEvent::DiscardGeneration { question_index } => {
                self.discard_generation(question_index);
            }
            InboundEvent::ChatMessage { history, message } => {
                let session = self.clone();
                self.tasks.spawn(async move {
                    let _ = session.chat(history, message).await;
                });
            }
            InboundEvent::ResetSession { context_id } => {
                let context = context_id.map(|id| self.catalog.select(&id));
                self.reset_state(context);
            }
        }
    }

    /// Let running analyses, generations and chats finish, then stop the
    /// coordinator and the scheduler.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.scheduler.shutdown().await;
        info!("Survey session shut down");
    }
}
