//! LLM-backed ambiguity detection.
//!
//! Two calls, the second only when warranted:
//!
//! 1. A one-token yes/no classification with logprobs at `analysis`
//!    priority. Confidence is `exp(logprob)` of the answer token.
//! 2. If ambiguous and confidence reaches `medium_confidence`, an
//!    interpretation request at `intervention` priority returning the
//!    trigger phrase and three interpretations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::parse::{parse_json_object, parse_yes_no, ParseError};
use super::{AmbiguityDetector, AmbiguityResult, AnalyzerResult, InterventionStyle};
use crate::config::AnalysisConfig;
use crate::context::QuestionContext;
use crate::prompts::{self, AmbiguityTaxonomy};
use crate::scheduler::{ChatMessage, ModelParams, PriorityClass, RequestScheduler};

const INTERPRETATION_MAX_TOKENS: u32 = 200;
const INTERPRETATION_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Deserialize)]
struct Interpretations {
    interpretations: Vec<String>,
    trigger_phrase: String,
}

pub struct LlmAmbiguityDetector {
    scheduler: RequestScheduler,
    config: AnalysisConfig,
    taxonomy: Arc<AmbiguityTaxonomy>,
}

impl LlmAmbiguityDetector {
    pub fn new(scheduler: RequestScheduler, config: AnalysisConfig) -> Self {
        Self {
            scheduler,
            config,
            taxonomy: Arc::new(AmbiguityTaxonomy::default()),
        }
    }

    pub fn with_taxonomy(mut self, taxonomy: AmbiguityTaxonomy) -> Self {
        self.taxonomy = Arc::new(taxonomy);
        self
    }

    /// Map a classifier confidence to an intervention style.
    pub fn style_for(&self, confidence: f64) -> Option<InterventionStyle> {
        if confidence >= self.config.high_confidence {
            Some(InterventionStyle::MultipleChoice)
        } else if confidence >= self.config.medium_confidence {
            Some(InterventionStyle::Clarification)
        } else {
            None
        }
    }

    async fn interpret(
        &self,
        question: &QuestionContext,
        analysis_prompt: String,
    ) -> AnalyzerResult<Interpretations> {
        let messages = vec![
            ChatMessage::system(prompts::interpretation_prompt(&self.taxonomy, &question.system_name)),
            ChatMessage::user(analysis_prompt),
        ];
        let params = ModelParams::new(&self.config.model)
            .max_tokens(INTERPRETATION_MAX_TOKENS)
            .temperature(INTERPRETATION_TEMPERATURE);

        let completion = self
            .scheduler
            .submit_and_wait(messages, PriorityClass::Intervention, params, self.config.await_timeout())
            .await?;

        let parsed: Interpretations = parse_json_object(&completion.content)?;
        if parsed.trigger_phrase.trim().is_empty() {
            return Err(ParseError::malformed("a non-empty trigger_phrase", &completion.content).into());
        }
        Ok(parsed)
    }
}

#[async_trait]
impl AmbiguityDetector for LlmAmbiguityDetector {
    async fn detect(&self, text: &str, question: &QuestionContext) -> AnalyzerResult<AmbiguityResult> {
        let analysis_prompt = prompts::analysis_prompt(question, text);
        let messages = vec![
            ChatMessage::system(prompts::ambiguity_detection_prompt(&self.taxonomy, &question.system_name)),
            ChatMessage::user(analysis_prompt.clone()),
        ];
        let params = ModelParams::new(&self.config.model)
            .max_tokens(1)
            .temperature(0.0)
            .with_logprobs(1);

        let completion = self
            .scheduler
            .submit_and_wait(messages, PriorityClass::Analysis, params, self.config.await_timeout())
            .await?;

        let is_ambiguous = parse_yes_no(&completion.content)?;
        let confidence = completion
            .first_token_logprob()
            .map(f64::exp)
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);

        if !is_ambiguous {
            debug!(question_index = question.index, confidence, "No ambiguity detected");
            return Ok(AmbiguityResult::clear(confidence));
        }

        let Some(style) = self.style_for(confidence) else {
            info!(question_index = question.index, confidence, "Low-confidence ambiguity, no intervention text");
            return Ok(AmbiguityResult::flagged(confidence));
        };

        let parsed = self.interpret(question, analysis_prompt).await?;
        info!(
            question_index = question.index,
            confidence,
            ?style,
            trigger_phrase = %parsed.trigger_phrase,
            "Ambiguity detected"
        );

        let suggestions = match style {
            InterventionStyle::MultipleChoice => parsed.interpretations,
            InterventionStyle::Clarification => Vec::new(),
        };
        Ok(AmbiguityResult {
            is_ambiguous: true,
            confidence,
            trigger_phrase: Some(parsed.trigger_phrase),
            suggestions,
            style: Some(style),
        })
    }
}
