//! Completion provider seam and its error taxonomy.
//!
//! | Kind          | Transient | Scheduler behaviour            |
//! |---------------|-----------|--------------------------------|
//! | `RateLimited` | yes       | retry with exponential backoff |
//! | `Transport`   | yes       | retry with exponential backoff |
//! | `Timeout`     | yes       | retry with exponential backoff |
//! | `Rejected`    | no        | terminal on first occurrence   |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{ChatMessage, Completion, ModelParams};

/// Classification of a single failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP 429 or an explicit quota message.
    RateLimited,
    /// Connection failure, 5xx, truncated body.
    Transport,
    /// The per-model call timeout elapsed.
    Timeout,
    /// The provider refused the request (bad parameters, auth, malformed reply).
    Rejected,
}

impl ProviderErrorKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Transport => write!(f, "transport_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Error from one provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Rejected, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Terminal outcome of a request whose attempts were all used up.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("provider failed after {attempts} attempt(s): {last_cause}")]
pub struct ProviderFailure {
    pub attempts: u32,
    pub last_cause: ProviderError,
}

/// Exactly one of these is produced per scheduled request.
pub type CompletionOutcome = Result<Completion, ProviderFailure>;

/// The external completion service.
///
/// Implementations must not retry internally; retry and backoff are owned by
/// the scheduler.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
    ) -> Result<Completion, ProviderError>;
}
