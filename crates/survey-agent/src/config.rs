use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use survey_coordination::{ContextCatalog, CoordinationConfig, SurveyContext, DEFAULT_CONTEXT_ID};
use tracing::info;

const ENV_BASE_URL: &str = "SURVEY_LLM_BASE_URL";
const ENV_API_KEY: &str = "SURVEY_LLM_API_KEY";
const ENV_CONTEXT_FILE: &str = "SURVEY_CONTEXT_FILE";
const ENV_CONTEXT_ID: &str = "SURVEY_CONTEXT_ID";
const ENV_CONFIG: &str = "SURVEY_CONFIG";

/// Chat-completions endpoint settings.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    /// HTTP client timeout; the scheduler applies its own per-model timeout on top.
    pub request_timeout: Duration,
}

impl Endpoint {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: Endpoint,
    /// JSON file of named survey contexts.
    pub context_file: Option<PathBuf>,
    pub context_id: String,
    /// TOML file with coordination settings.
    pub config_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint {
                base_url: "https://api.openai.com/v1".into(),
                api_key: None,
                request_timeout: Duration::from_secs(120),
            },
            context_file: None,
            context_id: DEFAULT_CONTEXT_ID.into(),
            config_file: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: Endpoint {
                base_url: std::env::var(ENV_BASE_URL).unwrap_or(defaults.endpoint.base_url),
                api_key: std::env::var(ENV_API_KEY).ok().filter(|k| !k.is_empty()),
                request_timeout: defaults.endpoint.request_timeout,
            },
            context_file: std::env::var(ENV_CONTEXT_FILE).ok().map(PathBuf::from),
            context_id: std::env::var(ENV_CONTEXT_ID).unwrap_or(defaults.context_id),
            config_file: std::env::var(ENV_CONFIG).ok().map(PathBuf::from),
        }
    }

    /// Coordination settings from the TOML file if configured, else defaults;
    /// environment overrides apply either way.
    pub fn coordination(&self) -> Result<CoordinationConfig> {
        let config = match &self.config_file {
            Some(path) => load_coordination(path)?,
            None => CoordinationConfig::from_env(),
        };
        config.validate().context("Invalid coordination configuration")?;
        Ok(config)
    }

    /// The context catalog (empty without a context file) and the selected context.
    pub fn contexts(&self) -> Result<(ContextCatalog, SurveyContext)> {
        let catalog = match &self.context_file {
            Some(path) => ContextCatalog::load(path)
                .with_context(|| format!("Failed to load survey contexts from {}", path.display()))?,
            None => ContextCatalog::default(),
        };
        let context = catalog.select(&self.context_id);
        info!(
            context_id = %self.context_id,
            system = %context.system_name(),
            questions = context.questions.len(),
            "Survey context selected"
        );
        Ok((catalog, context))
    }
}

fn load_coordination(path: &Path) -> Result<CoordinationConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    CoordinationConfig::from_toml_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))
}
