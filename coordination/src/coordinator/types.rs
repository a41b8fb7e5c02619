//! Segment, request and intervention types for the analysis coordinator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyzers::InterventionStyle;
use crate::context::SurveyContext;

/// Stable identity of one edited text segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SegmentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Caller's view of one segment, as carried by an update event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInput {
    pub segment_id: SegmentId,
    pub text: String,
    #[serde(default)]
    pub question_index: u32,
    #[serde(default)]
    pub position_index: u32,
}

/// One accepted edit of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUpdate {
    pub segment_id: SegmentId,
    pub text: String,
    pub question_index: u32,
    pub position_index: u32,
    /// The caller's full segment set at the time of the edit.
    #[serde(default)]
    pub all_segments: Vec<SegmentInput>,
}

impl SegmentUpdate {
    pub fn new(segment_id: impl Into<SegmentId>, text: impl Into<String>, question_index: u32) -> Self {
        Self {
            segment_id: segment_id.into(),
            text: text.into(),
            question_index,
            position_index: 0,
            all_segments: Vec::new(),
        }
    }

    pub fn with_position(mut self, position_index: u32) -> Self {
        self.position_index = position_index;
        self
    }

    pub fn with_segments(mut self, all_segments: Vec<SegmentInput>) -> Self {
        self.all_segments = all_segments;
        self
    }
}

/// Identity of one analysis run: a segment at a specific accepted version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub segment_id: SegmentId,
    pub version: u64,
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.segment_id, self.version)
    }
}

/// A segment as the coordinator knew it when a request was accepted.
///
/// `version` is the accepted-update version the text reflects, or 0 for
/// segments the coordinator has only seen through a caller's segment list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub segment_id: SegmentId,
    pub text: String,
    pub question_index: u32,
    pub position_index: u32,
    pub version: u64,
}

/// Latest accepted state of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentRecord {
    pub text: String,
    pub question_index: u32,
    pub position_index: u32,
    pub version: u64,
}

/// "Analyze this exact text version of this segment." Never mutated after
/// creation; superseded requests are dropped or marked for discard.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub key: RequestKey,
    pub text: String,
    pub question_index: u32,
    pub position_index: u32,
    pub submitted_at: DateTime<Utc>,
    /// Every known segment (including this one) at acceptance time.
    pub snapshot: Vec<SegmentSnapshot>,
    pub context: Arc<SurveyContext>,
}

impl AnalysisRequest {
    pub fn current(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            segment_id: self.key.segment_id.clone(),
            text: self.text.clone(),
            question_index: self.question_index,
            position_index: self.position_index,
            version: self.key.version,
        }
    }

    /// Non-empty segments other than this one.
    pub fn prior_segments(&self) -> Vec<SegmentSnapshot> {
        self.snapshot
            .iter()
            .filter(|s| s.segment_id != self.key.segment_id && !s.text.trim().is_empty())
            .cloned()
            .collect()
    }

    /// Version of `segment_id` captured in this request's snapshot.
    pub fn snapshot_version(&self, segment_id: &SegmentId) -> Option<u64> {
        self.snapshot
            .iter()
            .find(|s| &s.segment_id == segment_id)
            .map(|s| s.version)
    }
}

/// One intervention proposed for a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterventionCandidate {
    Ambiguity {
        /// `None` when confidence was too low to generate intervention text.
        style: Option<InterventionStyle>,
        confidence: f64,
        trigger_phrase: Option<String>,
        #[serde(default)]
        suggestions: Vec<String>,
    },
    Consistency {
        confidence: f64,
        previous_segment_id: SegmentId,
        previous_text: String,
        current_text: String,
        /// Version of the referenced segment the comparison used.
        previous_version: u64,
    },
}

impl InterventionCandidate {
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Ambiguity { confidence, .. } | Self::Consistency { confidence, .. } => *confidence,
        }
    }

    /// The other segment this candidate depends on, if any.
    pub fn referenced_segment(&self) -> Option<(&SegmentId, u64)> {
        match self {
            Self::Consistency {
                previous_segment_id,
                previous_version,
                ..
            } => Some((previous_segment_id, *previous_version)),
            Self::Ambiguity { .. } => None,
        }
    }
}

/// Where a segment currently is in its analysis lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentPhase {
    Idle,
    Queued,
    Processing,
}

impl std::fmt::Display for SegmentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
        }
    }
}

/// Coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Updates accepted.
    pub accepted: u64,
    /// Requests moved from queued to processing.
    pub dispatched: u64,
    /// `analysis_complete` events published.
    pub delivered: u64,
    /// Completed runs dropped because a newer update superseded them.
    pub discarded: u64,
    /// `analysis_error` events published.
    pub errors: u64,
    /// Results currently held while paused.
    pub held: usize,
}
