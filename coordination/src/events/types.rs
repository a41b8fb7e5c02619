//! Inbound and outbound event types exchanged with the transport layer
//!
//! Both enums are internally tagged on `type` with snake_case names, so a
//! JSON transport can pass them through unchanged:
//!
//! ```json
//! {"type": "segment_update", "segment_id": "s1", "text": "...", "question_index": 0, "position_index": 0}
//! {"type": "analysis_complete", "segment_id": "s1", "version": 7, "interventions": [], "timestamp": "..."}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::types::{InterventionCandidate, RequestKey, SegmentId, SegmentInput, SegmentUpdate};
use crate::scheduler::ChatMessage;
use crate::stability::{Requirement, SegmentStability, SegmentText, TriggerMode};

/// Events accepted from the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    SegmentUpdate {
        segment_id: SegmentId,
        text: String,
        question_index: u32,
        #[serde(default)]
        position_index: u32,
        #[serde(default)]
        all_segments: Vec<SegmentInput>,
    },

    PauseAnalysis,

    ResumeAnalysis,

    StabilityCheck {
        question_index: u32,
    },

    GenerateRequirements {
        question_index: u32,
        segments: Vec<SegmentText>,
        #[serde(default)]
        trigger_mode: TriggerMode,
    },

    DiscardGeneration {
        question_index: u32,
    },

    ChatMessage {
        #[serde(default)]
        history: Vec<ChatMessage>,
        message: String,
    },

    /// Clear all session state; optionally switch survey context.
    ResetSession {
        #[serde(default)]
        context_id: Option<String>,
    },
}

impl InboundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SegmentUpdate { .. } => "segment_update",
            Self::PauseAnalysis => "pause_analysis",
            Self::ResumeAnalysis => "resume_analysis",
            Self::StabilityCheck { .. } => "stability_check",
            Self::GenerateRequirements { .. } => "generate_requirements",
            Self::DiscardGeneration { .. } => "discard_generation",
            Self::ChatMessage { .. } => "chat_message",
            Self::ResetSession { .. } => "reset_session",
        }
    }
}

impl From<SegmentUpdate> for InboundEvent {
    fn from(update: SegmentUpdate) -> Self {
        Self::SegmentUpdate {
            segment_id: update.segment_id,
            text: update.text,
            question_index: update.question_index,
            position_index: update.position_index,
            all_segments: update.all_segments,
        }
    }
}

/// Events emitted to the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    AnalysisComplete {
        segment_id: SegmentId,
        version: u64,
        interventions: Vec<InterventionCandidate>,
        timestamp: DateTime<Utc>,
    },

    AnalysisError {
        segment_id: SegmentId,
        version: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    StabilityResponse {
        question_index: u32,
        is_stable: bool,
        segments: BTreeMap<SegmentId, SegmentStability>,
        timestamp: DateTime<Utc>,
    },

    RequirementGenerationComplete {
        question_index: u32,
        requirements: Vec<Requirement>,
        timestamp: DateTime<Utc>,
    },

    RequirementGenerationFailed {
        question_index: u32,
        error: String,
        details: Option<String>,
        timestamp: DateTime<Utc>,
    },

    ChatReply {
        content: String,
        timestamp: DateTime<Utc>,
    },

    ChatFailed {
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundEvent {
    pub fn analysis_complete(key: &RequestKey, interventions: Vec<InterventionCandidate>) -> Self {
        Self::AnalysisComplete {
            segment_id: key.segment_id.clone(),
            version: key.version,
            interventions,
            timestamp: Utc::now(),
        }
    }

    pub fn analysis_error(key: &RequestKey, error: impl Into<String>) -> Self {
        Self::AnalysisError {
            segment_id: key.segment_id.clone(),
            version: key.version,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AnalysisComplete { .. } => "analysis_complete",
            Self::AnalysisError { .. } => "analysis_error",
            Self::StabilityResponse { .. } => "stability_response",
            Self::RequirementGenerationComplete { .. } => "requirement_generation_complete",
            Self::RequirementGenerationFailed { .. } => "requirement_generation_failed",
            Self::ChatReply { .. } => "chat_reply",
            Self::ChatFailed { .. } => "chat_failed",
        }
    }

    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::AnalysisComplete { timestamp, .. }
            | Self::AnalysisError { timestamp, .. }
            | Self::StabilityResponse { timestamp, .. }
            | Self::RequirementGenerationComplete { timestamp, .. }
            | Self::RequirementGenerationFailed { timestamp, .. }
            | Self::ChatReply { timestamp, .. }
            | Self::ChatFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Segment this event is about, if any.
    pub fn segment_id(&self) -> Option<&SegmentId> {
        match self {
            Self::AnalysisComplete { segment_id, .. } | Self::AnalysisError { segment_id, .. } => {
                Some(segment_id)
            }
            _ => None,
        }
    }

    /// Question this event is about, if any.
    pub fn question_index(&self) -> Option<u32> {
        match self {
            Self::StabilityResponse { question_index, .. }
            | Self::RequirementGenerationComplete { question_index, .. }
            | Self::RequirementGenerationFailed { question_index, .. } => Some(*question_index),
            _ => None,
        }
    }
}
