//! Survey context: the question set and system description that analyzers
//! and prompts are framed against.
//!
//! A [`SurveyContext`] is an ordinary value owned by the session and handed
//! to each analysis request, so swapping contexts (see
//! [`SurveySession::reset_state`](crate::session::SurveySession::reset_state))
//! never leaks state between sessions. A [`ContextCatalog`] holds several
//! named contexts loaded from one JSON document:
//!
//! ```json
//! {
//!   "context1": {
//!     "questions": { "0": "What should the system do?" },
//!     "system_context": { "name": "module review system", "description": "...", "type": "Web Application" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Context id used when a requested id is unknown.
pub const DEFAULT_CONTEXT_ID: &str = "context1";

/// Errors loading a context catalog.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Failed to read context file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid context JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;

/// Description of the system the survey elicits requirements for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemContext {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_system_kind")]
    pub kind: String,
}

fn default_system_kind() -> String {
    "Web Application".to_string()
}

impl Default for SystemContext {
    fn default() -> Self {
        Self {
            name: "System".to_string(),
            description: String::new(),
            kind: default_system_kind(),
        }
    }
}

/// Questions keyed by their index (as a string, matching the JSON form)
/// plus the system description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyContext {
    #[serde(default)]
    pub questions: BTreeMap<String, String>,
    #[serde(default)]
    pub system_context: SystemContext,
}

impl SurveyContext {
    pub fn new(system: SystemContext) -> Self {
        Self {
            questions: BTreeMap::new(),
            system_context: system,
        }
    }

    pub fn with_question(mut self, index: u32, text: impl Into<String>) -> Self {
        self.questions.insert(index.to_string(), text.into());
        self
    }

    pub fn question_text(&self, index: u32) -> Option<&str> {
        self.questions.get(&index.to_string()).map(String::as_str)
    }

    /// Context for one question. Unknown indices get a placeholder text.
    pub fn question(&self, index: u32) -> QuestionContext {
        let text = match self.question_text(index) {
            Some(text) => text.to_string(),
            None => {
                warn!(question_index = index, "Question not found in survey context");
                format!("Question {index}")
            }
        };
        QuestionContext {
            index,
            text,
            system_name: self.system_context.name.clone(),
        }
    }

    pub fn system_name(&self) -> &str {
        &self.system_context.name
    }
}

/// What an analyzer needs to know about the question a segment answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionContext {
    pub index: u32,
    pub text: String,
    pub system_name: String,
}

/// Named survey contexts, selectable by id.
#[derive(Debug, Clone, Default)]
pub struct ContextCatalog {
    contexts: BTreeMap<String, SurveyContext>,
}

impl ContextCatalog {
    pub fn from_json_str(raw: &str) -> ContextResult<Self> {
        let contexts: BTreeMap<String, SurveyContext> = serde_json::from_str(raw)?;
        Ok(Self { contexts })
    }

    pub fn load(path: impl AsRef<Path>) -> ContextResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ContextError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json_str(&raw)?;
        info!(path = %path.display(), contexts = catalog.len(), "Loaded survey contexts");
        Ok(catalog)
    }

    pub fn insert(&mut self, id: impl Into<String>, context: SurveyContext) {
        self.contexts.insert(id.into(), context);
    }

    /// The context named `id`, else the default context, else an empty one.
    pub fn select(&self, id: &str) -> SurveyContext {
        if let Some(context) = self.contexts.get(id) {
            return context.clone();
        }
        warn!(context_id = id, fallback = DEFAULT_CONTEXT_ID, "Context not found, using default");
        self.contexts
            .get(DEFAULT_CONTEXT_ID)
            .cloned()
            .unwrap_or_default()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
