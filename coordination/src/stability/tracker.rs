//! Per-segment similarity history and stability classification.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::similarity::text_similarity;
use crate::config::StabilityConfig;
use crate::coordinator::types::SegmentId;

/// Shared reference to StabilityTracker
pub type SharedStabilityTracker = Arc<Mutex<StabilityTracker>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityPoint {
    pub score: f64,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

/// Result of recording one segment edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityUpdate {
    pub segment_id: SegmentId,
    /// `None` on the first edit of a segment.
    pub similarity: Option<f64>,
    pub is_first_update: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityReason {
    NoUpdates,
    HighSimilarity,
    StabilizingTrend,
    Unstable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentStability {
    pub is_stable: bool,
    pub confidence: f64,
    pub reason: StabilityReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionStability {
    pub question_index: u32,
    pub is_stable: bool,
    pub segments: BTreeMap<SegmentId, SegmentStability>,
}

#[derive(Debug, Clone)]
struct LatestText {
    text: String,
    question_index: u32,
    position_index: u32,
    updated_at: DateTime<Utc>,
}

/// Tracks how much each segment still changes between edits.
#[derive(Debug, Default)]
pub struct StabilityTracker {
    config: StabilityConfig,
    /// question -> segment -> similarity history
    history: HashMap<u32, HashMap<SegmentId, Vec<SimilarityPoint>>>,
    latest: HashMap<SegmentId, LatestText>,
}

impl StabilityTracker {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Create a shared reference to this tracker
    pub fn shared(self) -> SharedStabilityTracker {
        Arc::new(Mutex::new(self))
    }

    /// Compare `text` with the segment's previous version and record it.
    pub fn record_update(
        &mut self,
        segment_id: &SegmentId,
        text: &str,
        question_index: u32,
        position_index: u32,
    ) -> SimilarityUpdate {
        let now = Utc::now();
        let similarity = self.latest.get(segment_id).map(|previous| {
            let score = text_similarity(&previous.text, text);
            self.history
                .entry(question_index)
                .or_default()
                .entry(segment_id.clone())
                .or_default()
                .push(SimilarityPoint {
                    score,
                    text: text.to_string(),
                    recorded_at: now,
                });
            score
        });

        match similarity {
            Some(score) => debug!(segment_id = %segment_id, question_index, similarity = score, "Segment similarity updated"),
            None => debug!(segment_id = %segment_id, question_index, "First version of segment recorded"),
        }

        self.latest.insert(
            segment_id.clone(),
            LatestText {
                text: text.to_string(),
                question_index,
                position_index,
                updated_at: now,
            },
        );

        SimilarityUpdate {
            segment_id: segment_id.clone(),
            similarity,
            is_first_update: similarity.is_none(),
        }
    }

    pub fn history(&self, question_index: u32, segment_id: &SegmentId) -> &[SimilarityPoint] {
        self.history
            .get(&question_index)
            .and_then(|segments| segments.get(segment_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn segment_stability(&self, question_index: u32, segment_id: &SegmentId) -> SegmentStability {
        let history = self.history(question_index, segment_id);
        let Some(latest) = history.last().map(|p| p.score) else {
            return SegmentStability {
                is_stable: true,
                confidence: 1.0,
                reason: StabilityReason::NoUpdates,
            };
        };

        let reason = if latest > self.config.high_similarity {
            StabilityReason::HighSimilarity
        } else {
            match history {
                [.., previous, last]
                    if last.score - previous.score >= 0.0
                        && latest > self.config.moderate_similarity =>
                {
                    StabilityReason::StabilizingTrend
                }
                _ => StabilityReason::Unstable,
            }
        };

        SegmentStability {
            is_stable: reason != StabilityReason::Unstable,
            confidence: latest,
            reason,
        }
    }

    /// A question is stable iff every one of its known segments is.
    pub fn question_stability(&self, question_index: u32) -> QuestionStability {
        let segments: BTreeMap<SegmentId, SegmentStability> = self
            .latest
            .iter()
            .filter(|(_, latest)| latest.question_index == question_index)
            .map(|(id, _)| (id.clone(), self.segment_stability(question_index, id)))
            .collect();
        let is_stable = segments.values().all(|s| s.is_stable);
        QuestionStability {
            question_index,
            is_stable,
            segments,
        }
    }

    /// Segment ids of a question ordered by position.
    pub fn question_segments(&self, question_index: u32) -> Vec<SegmentId> {
        let mut segments: Vec<(&SegmentId, &LatestText)> = self
            .latest
            .iter()
            .filter(|(_, latest)| latest.question_index == question_index)
            .collect();
        segments.sort_by_key(|(id, latest)| (latest.position_index, (*id).clone()));
        segments.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// When a segment was last edited.
    pub fn last_updated(&self, segment_id: &SegmentId) -> Option<DateTime<Utc>> {
        self.latest.get(segment_id).map(|l| l.updated_at)
    }

    /// Drop history and latest texts of every segment in the question.
    pub fn clear_question(&mut self, question_index: u32) {
        self.history.remove(&question_index);
        let before = self.latest.len();
        self.latest.retain(|_, latest| latest.question_index != question_index);
        info!(question_index, removed = before - self.latest.len(), "Cleared question stability state");
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.latest.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SegmentId {
        SegmentId::from(s)
    }

    fn push_score(tracker: &mut StabilityTracker, q: u32, seg: &str, score: f64) {
        tracker
            .history
            .entry(q)
            .or_default()
            .entry(id(seg))
            .or_default()
            .push(SimilarityPoint {
                score,
                text: String::new(),
                recorded_at: Utc::now(),
            });
    }

    #[test]
    fn test_first_update_has_no_similarity() {
        let mut tracker = StabilityTracker::default();
        let first = tracker.record_update(&id("s1"), "reviews load fast", 0, 0);
        assert!(first.is_first_update);
        assert_eq!(first.similarity, None);

        let second = tracker.record_update(&id("s1"), "reviews load fast", 0, 0);
        assert!(!second.is_first_update);
        assert_eq!(second.similarity, Some(1.0));
        assert_eq!(tracker.history(0, &id("s1")).len(), 1);
    }

    #[test]
    fn test_no_history_is_stable() {
        let tracker = StabilityTracker::default();
        let stability = tracker.segment_stability(0, &id("s1"));
        assert!(stability.is_stable);
        assert_eq!(stability.reason, StabilityReason::NoUpdates);
        assert_eq!(stability.confidence, 1.0);
    }

    #[test]
    fn test_classification_rules() {
        let mut tracker = StabilityTracker::default();

        push_score(&mut tracker, 0, "high", 0.85);
        assert_eq!(tracker.segment_stability(0, &id("high")).reason, StabilityReason::HighSimilarity);

        // Exactly at the threshold is not "above" it.
        push_score(&mut tracker, 0, "edge", 0.8);
        assert_eq!(tracker.segment_stability(0, &id("edge")).reason, StabilityReason::Unstable);

        push_score(&mut tracker, 0, "trend", 0.72);
        push_score(&mut tracker, 0, "trend", 0.75);
        assert_eq!(tracker.segment_stability(0, &id("trend")).reason, StabilityReason::StabilizingTrend);

        push_score(&mut tracker, 0, "falling", 0.78);
        push_score(&mut tracker, 0, "falling", 0.75);
        assert_eq!(tracker.segment_stability(0, &id("falling")).reason, StabilityReason::Unstable);

        push_score(&mut tracker, 0, "lonely", 0.75);
        let lonely = tracker.segment_stability(0, &id("lonely"));
        assert!(!lonely.is_stable);
        assert_eq!(lonely.confidence, 0.75);
    }

    #[test]
    fn test_question_stability_is_conjunction() {
        let mut tracker = StabilityTracker::default();
        tracker.record_update(&id("a"), "reviews load fast", 1, 0);
        tracker.record_update(&id("b"), "students comment", 1, 1);
        tracker.record_update(&id("c"), "other question", 2, 0);
        assert!(tracker.question_stability(1).is_stable);

        tracker.record_update(&id("b"), "lecturers approve every change", 1, 1);
        let stability = tracker.question_stability(1);
        assert!(!stability.is_stable);
        assert_eq!(stability.segments.len(), 2);
        assert!(stability.segments[&id("a")].is_stable);
        assert!(!stability.segments[&id("b")].is_stable);

        assert!(tracker.question_stability(9).is_stable);
        assert_eq!(tracker.question_segments(1), vec![id("a"), id("b")]);
    }

    #[test]
    fn test_clear_question_only_touches_that_question() {
        let mut tracker = StabilityTracker::default();
        tracker.record_update(&id("a"), "one", 1, 0);
        tracker.record_update(&id("a"), "one two", 1, 0);
        tracker.record_update(&id("c"), "three", 2, 0);

        tracker.clear_question(1);
        assert!(tracker.history(1, &id("a")).is_empty());
        assert!(tracker.last_updated(&id("a")).is_none());
        assert!(tracker.last_updated(&id("c")).is_some());

        let again = tracker.record_update(&id("a"), "one two", 1, 0);
        assert!(again.is_first_update);
    }
}
