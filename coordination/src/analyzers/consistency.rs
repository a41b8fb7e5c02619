//! LLM-backed contradiction checking between a segment and its siblings.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::parse::parse_json_array;
use super::{AnalyzerResult, ConsistencyChecker, ConsistencyResult, Contradiction};
use crate::config::AnalysisConfig;
use crate::context::SurveyContext;
use crate::coordinator::types::{SegmentId, SegmentSnapshot};
use crate::prompts;
use crate::scheduler::{ChatMessage, ModelParams, PriorityClass, RequestScheduler};

const CONSISTENCY_MAX_TOKENS: u32 = 500;

#[derive(Debug, Deserialize)]
struct ScoredPair {
    segment_id: SegmentId,
    contradiction_score: f64,
}

pub struct LlmConsistencyChecker {
    scheduler: RequestScheduler,
    config: AnalysisConfig,
}

impl LlmConsistencyChecker {
    pub fn new(scheduler: RequestScheduler, config: AnalysisConfig) -> Self {
        Self { scheduler, config }
    }

    fn frame(context: &SurveyContext, segment: &SegmentSnapshot) -> String {
        let question = context.question(segment.question_index);
        prompts::framed_statement(context.system_name(), &question.text, &segment.text)
    }
}

#[async_trait]
impl ConsistencyChecker for LlmConsistencyChecker {
    async fn check(
        &self,
        current: &SegmentSnapshot,
        prior: &[SegmentSnapshot],
        context: &SurveyContext,
    ) -> AnalyzerResult<ConsistencyResult> {
        let prior: HashMap<&SegmentId, &SegmentSnapshot> = prior
            .iter()
            .filter(|s| s.segment_id != current.segment_id && !s.text.trim().is_empty())
            .map(|s| (&s.segment_id, s))
            .collect();

        if prior.is_empty() {
            debug!(segment_id = %current.segment_id, "No prior segments to check against");
            return Ok(ConsistencyResult::default());
        }

        let mut listed: Vec<(String, String)> = prior
            .values()
            .map(|s| (s.segment_id.to_string(), Self::frame(context, s)))
            .collect();
        listed.sort();

        let messages = vec![
            ChatMessage::system(prompts::CONSISTENCY_SYSTEM_PROMPT),
            ChatMessage::user(prompts::consistency_prompt(&Self::frame(context, current), &listed)),
        ];
        let params = ModelParams::new(&self.config.model)
            .max_tokens(CONSISTENCY_MAX_TOKENS)
            .temperature(0.0);

        let completion = self
            .scheduler
            .submit_and_wait(messages, PriorityClass::Analysis, params, self.config.await_timeout())
            .await?;
        let scored: Vec<ScoredPair> = parse_json_array(&completion.content)?;

        // Highest score per referenced segment; unknown ids are ignored.
        let mut best: HashMap<&SegmentId, f64> = HashMap::new();
        for pair in &scored {
            if !pair.contradiction_score.is_finite() {
                continue;
            }
            if let Some((id, _)) = prior.get_key_value(&pair.segment_id) {
                let entry = best.entry(*id).or_insert(f64::MIN);
                *entry = entry.max(pair.contradiction_score);
            }
        }

        let mut contradictions: Vec<Contradiction> = best
            .into_iter()
            .filter(|(_, score)| *score >= self.config.contradiction_threshold)
            .map(|(id, score)| {
                let previous = prior[id];
                Contradiction {
                    previous_segment_id: previous.segment_id.clone(),
                    previous_text: previous.text.clone(),
                    previous_version: previous.version,
                    score,
                }
            })
            .collect();
        contradictions.sort_by(|a, b| a.previous_segment_id.cmp(&b.previous_segment_id));

        info!(
            segment_id = %current.segment_id,
            compared = prior.len(),
            contradictions = contradictions.len(),
            "Consistency check complete"
        );
        Ok(ConsistencyResult { contradictions })
    }
}
