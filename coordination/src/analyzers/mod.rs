//! Analyzer adapters
//!
//! Stateless translation between the coordinator and the scheduler: build a
//! prompt, submit it, await the outcome, parse it into a typed result.
//!
//! The coordinator only sees the [`AmbiguityDetector`] and
//! [`ConsistencyChecker`] traits, so tests and alternative back-ends can
//! replace the LLM-backed implementations.

pub mod ambiguity;
pub mod consistency;
pub mod parse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{QuestionContext, SurveyContext};
use crate::coordinator::types::{SegmentId, SegmentSnapshot};
use crate::scheduler::SchedulerError;

pub use ambiguity::LlmAmbiguityDetector;
pub use consistency::LlmConsistencyChecker;
pub use parse::ParseError;

/// How an ambiguity intervention is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStyle {
    /// Offer the generated interpretations as choices.
    MultipleChoice,
    /// Ask the author to clarify the trigger phrase.
    Clarification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityResult {
    pub is_ambiguous: bool,
    /// Probability of the classifier's answer.
    pub confidence: f64,
    pub trigger_phrase: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub style: Option<InterventionStyle>,
}

impl AmbiguityResult {
    pub fn clear(confidence: f64) -> Self {
        Self {
            is_ambiguous: false,
            confidence,
            trigger_phrase: None,
            suggestions: Vec::new(),
            style: None,
        }
    }

    /// Ambiguous, but not confident enough to generate intervention text.
    pub fn flagged(confidence: f64) -> Self {
        Self {
            is_ambiguous: true,
            ..Self::clear(confidence)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub previous_segment_id: SegmentId,
    pub previous_text: String,
    /// Version of the prior segment that was compared.
    pub previous_version: u64,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyResult {
    pub contradictions: Vec<Contradiction>,
}

impl ConsistencyResult {
    pub fn detected(&self) -> bool {
        !self.contradictions.is_empty()
    }
}

/// Errors surfaced by analyzers to the coordinator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalyzerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Analyzer failed: {0}")]
    Internal(String),
}

/// Result type for analyzer operations
pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

#[async_trait]
pub trait AmbiguityDetector: Send + Sync {
    async fn detect(&self, text: &str, question: &QuestionContext) -> AnalyzerResult<AmbiguityResult>;
}

#[async_trait]
pub trait ConsistencyChecker: Send + Sync {
    /// Compare `current` against `prior` (already filtered to non-empty
    /// segments other than `current`).
    async fn check(
        &self,
        current: &SegmentSnapshot,
        prior: &[SegmentSnapshot],
        context: &SurveyContext,
    ) -> AnalyzerResult<ConsistencyResult>;
}
