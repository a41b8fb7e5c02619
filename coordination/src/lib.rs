//! Survey Coordination Library
//!
//! Live analysis of free-text survey answers while the author types:
//! - Priority request scheduling onto a bounded pool of completion-provider workers
//! - Per-segment most-recent-wins analysis coordination (ambiguity + consistency)
//! - Segment stability tracking and discardable requirement generation
//!
//! # Components
//!
//! ## Request Scheduler (`scheduler`)
//! - Priority classes: chat (1), intervention (2), analysis (3), requirement (4)
//! - FIFO within a class, `max_concurrent_requests` workers
//! - Transient provider errors retried with exponential backoff
//!
//! ## Analysis Coordinator (`coordinator`)
//! - One authoritative result per segment version
//! - Superseded work is removed from the queue or discarded on completion
//! - Pause holds finished results until resume
//!
//! ## Stability / Generation (`stability`)
//! - Cosine similarity between successive segment texts
//! - Question stability as the conjunction of segment stability
//! - Requirement generation with per-question discard
//!
//! # Usage
//!
//! ```ignore
//! let (sink, mut events) = EventSink::channel();
//! let session = SurveySession::new(provider, CoordinationConfig::from_env(), context, sink);
//!
//! session.handle_segment_update(SegmentUpdate::new("s1", "Reviews should load fast", 0));
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

pub mod analyzers;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod prompts;
pub mod scheduler;
pub mod session;
pub mod stability;

// Re-export the session facade and its configuration
pub use config::{
    AnalysisConfig, ConfigError, ConfigResult, CoordinationConfig, GenerationConfig, ModelConfig,
    SchedulerConfig, StabilityConfig,
};
pub use context::{
    ContextCatalog, ContextError, QuestionContext, SurveyContext, SystemContext, DEFAULT_CONTEXT_ID,
};
pub use session::SurveySession;

// Re-export key scheduler types
pub use scheduler::{
    ChatMessage, Completion, CompletionHandle, CompletionProvider, HandleState, ModelParams,
    PriorityClass, ProviderError, ProviderErrorKind, ProviderFailure, RequestScheduler,
    SchedulerError, SchedulerResult, SchedulerStats,
};

// Re-export key coordinator types
pub use coordinator::{
    AnalysisCoordinator, CoordinatorStats, InterventionCandidate, RequestKey, SegmentId,
    SegmentInput, SegmentPhase, SegmentUpdate,
};

// Re-export analyzer seams
pub use analyzers::{
    AmbiguityDetector, AmbiguityResult, AnalyzerError, ConsistencyChecker, ConsistencyResult,
    Contradiction, InterventionStyle, ParseError,
};

// Re-export stability and generation types
pub use stability::{
    GenerationError, GenerationOutcome, QuestionStability, Requirement, SegmentStability,
    SegmentText, StabilityReason, StabilityTracker, TriggerMode,
};

// Re-export event types
pub use events::{EventReceiver, EventSink, InboundEvent, OutboundEvent, SinkError};
