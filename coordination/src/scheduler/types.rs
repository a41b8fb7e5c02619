//! Request and completion types shared by the scheduler and its callers.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Unique identifier for a completion request.
pub type RequestId = String;

/// Coarse scheduling class. Lower rank is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Interactive assistant chat; the author is waiting on it.
    Chat,
    /// Generating the text of an intervention (interpretations, suggestions).
    Intervention,
    /// Background ambiguity / consistency analysis.
    Analysis,
    /// Bulk requirement synthesis for a whole question.
    Requirement,
}

impl PriorityClass {
    /// Numeric rank used for ordering (lower = served first).
    pub fn rank(self) -> u8 {
        match self {
            Self::Chat => 1,
            Self::Intervention => 2,
            Self::Analysis => 3,
            Self::Requirement => 4,
        }
    }
}

impl PartialOrd for PriorityClass {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityClass {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Intervention => write!(f, "intervention"),
            Self::Analysis => write!(f, "analysis"),
            Self::Requirement => write!(f, "requirement"),
        }
    }
}

/// A single chat-style message sent to the completion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-request model parameters.
///
/// Unset fields are filled from the model's configured defaults when the
/// request is submitted; anything set here wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the provider for per-token log probabilities.
    #[serde(default)]
    pub logprobs: bool,
    pub top_logprobs: Option<u8>,
}

impl ModelParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn with_logprobs(mut self, top: u8) -> Self {
        self.logprobs = true;
        self.top_logprobs = Some(top);
        self
    }
}

/// A logical completion request waiting in (or taken from) the scheduler queue.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub request_id: RequestId,
    pub priority: PriorityClass,
    pub messages: Vec<ChatMessage>,
    pub params: ModelParams,
    pub submitted_at: Instant,
    /// Monotonic submission counter; final tie-breaker in queue ordering.
    pub sequence: u64,
}

/// Log probability reported for one generated token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f64,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Successful provider response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    #[serde(default)]
    pub logprobs: Vec<TokenLogprob>,
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_logprobs(mut self, logprobs: Vec<TokenLogprob>) -> Self {
        self.logprobs = logprobs;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Log probability of the first generated token, if reported.
    pub fn first_token_logprob(&self) -> Option<f64> {
        self.logprobs.first().map(|t| t.logprob)
    }
}
