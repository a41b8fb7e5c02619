//! Runtime configuration for the scheduler, analyzers, stability tracking and
//! requirement generation.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (e.g. `SURVEY_MAX_CONCURRENT_REQUESTS`)
//! 2. Values from a TOML file passed to [`CoordinationConfig::from_toml_str`]
//! 3. Built-in defaults
//!
//! ## Defaults
//!
//! | Setting                   | Default |
//! |---------------------------|---------|
//! | max concurrent requests   | 3       |
//! | max retries               | 3       |
//! | retry delay               | 1 s     |
//! | analysis model            | gpt-4   |
//! | high / medium confidence  | 0.7 / 0.5 |
//! | contradiction threshold   | 0.9     |
//! | high / moderate similarity| 0.8 / 0.7 |

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::RetryPolicy;

const DEFAULT_MODEL: &str = "gpt-4";
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 3;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_AWAIT_TIMEOUT_MS: u64 = 30_000;

const ENV_MAX_CONCURRENT_REQUESTS: &str = "SURVEY_MAX_CONCURRENT_REQUESTS";
const ENV_MAX_RETRIES: &str = "SURVEY_MAX_RETRIES";
const ENV_RETRY_DELAY_MS: &str = "SURVEY_RETRY_DELAY_MS";
const ENV_ANALYSIS_MODEL: &str = "SURVEY_ANALYSIS_MODEL";
const ENV_GENERATION_MODEL: &str = "SURVEY_GENERATION_MODEL";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Per-model call defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound on a single provider call, in milliseconds.
    pub timeout_ms: u64,
}

impl ModelConfig {
    pub fn new(max_tokens: u32, temperature: f32, timeout_ms: u64) -> Self {
        Self {
            max_tokens,
            temperature,
            timeout_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::new(500, 0.3, 30_000)
    }
}

fn default_models() -> BTreeMap<String, ModelConfig> {
    let mut models = BTreeMap::new();
    models.insert("gpt-4".to_string(), ModelConfig::new(500, 0.3, 30_000));
    models.insert(
        "gpt-3.5-turbo".to_string(),
        ModelConfig::new(300, 0.5, 20_000),
    );
    models
}

/// Request scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size; also the cap on concurrent provider calls.
    pub max_concurrent_requests: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Cap on a single backoff sleep (0 = uncapped).
    pub max_backoff_ms: u64,
    /// Default caller-side await timeout for convenience helpers.
    pub default_await_timeout_ms: u64,
    /// Known models; unknown models fall back to `fallback_model`.
    pub models: BTreeMap<String, ModelConfig>,
    pub fallback_model: ModelConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            default_await_timeout_ms: DEFAULT_AWAIT_TIMEOUT_MS,
            models: default_models(),
            fallback_model: ModelConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Model defaults for `model`, or the fallback entry.
    pub fn model(&self, model: &str) -> &ModelConfig {
        self.models.get(model).unwrap_or(&self.fallback_model)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    pub fn default_await_timeout(&self) -> Duration {
        Duration::from_millis(self.default_await_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests must be > 0".to_string(),
            ));
        }
        for (name, model) in self.models.iter() {
            if model.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model '{name}' timeout_ms must be > 0"
                )));
            }
        }
        if self.fallback_model.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "fallback_model timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ambiguity / consistency analyzer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub model: String,
    /// At or above: multiple-choice intervention with suggestions.
    pub high_confidence: f64,
    /// At or above: clarification intervention; below: flag only.
    pub medium_confidence: f64,
    /// Minimum contradiction score for a consistency candidate.
    pub contradiction_threshold: f64,
    /// Caller-side timeout for each analyzer request.
    pub await_timeout_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            high_confidence: 0.7,
            medium_confidence: 0.5,
            contradiction_threshold: 0.9,
            await_timeout_ms: DEFAULT_AWAIT_TIMEOUT_MS,
        }
    }
}

impl AnalysisConfig {
    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("high_confidence", self.high_confidence),
            ("medium_confidence", self.medium_confidence),
            ("contradiction_threshold", self.contradiction_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if self.medium_confidence > self.high_confidence {
            return Err(ConfigError::Invalid(format!(
                "medium_confidence ({}) must not exceed high_confidence ({})",
                self.medium_confidence, self.high_confidence
            )));
        }
        Ok(())
    }
}

/// Similarity thresholds for segment stability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Latest similarity strictly above this is stable on its own.
    pub high_similarity: f64,
    /// Latest similarity strictly above this is stable with a non-decreasing trend.
    pub moderate_similarity: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            high_similarity: 0.8,
            moderate_similarity: 0.7,
        }
    }
}

impl StabilityConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.high_similarity)
            || !(0.0..=1.0).contains(&self.moderate_similarity)
        {
            return Err(ConfigError::Invalid(
                "similarity thresholds must be in [0, 1]".to_string(),
            ));
        }
        if self.moderate_similarity > self.high_similarity {
            return Err(ConfigError::Invalid(format!(
                "moderate_similarity ({}) must not exceed high_similarity ({})",
                self.moderate_similarity, self.high_similarity
            )));
        }
        Ok(())
    }
}

/// Requirement generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub await_timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 2_000,
            temperature: 0.3,
            await_timeout_ms: 120_000,
        }
    }
}

impl GenerationConfig {
    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }
}

/// Top-level configuration consumed by [`SurveySession`](crate::session::SurveySession).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub scheduler: SchedulerConfig,
    pub analysis: AnalysisConfig,
    pub stability: StabilityConfig,
    pub generation: GenerationConfig,
}

impl CoordinationConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Parse a TOML document, then apply environment overrides.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(n) = env_parse::<usize>(ENV_MAX_CONCURRENT_REQUESTS) {
            self.scheduler.max_concurrent_requests = n;
        }
        if let Some(n) = env_parse::<u32>(ENV_MAX_RETRIES) {
            self.scheduler.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>(ENV_RETRY_DELAY_MS) {
            self.scheduler.retry_delay_ms = ms;
        }
        if let Ok(model) = env::var(ENV_ANALYSIS_MODEL) {
            self.analysis.model = model;
        }
        if let Ok(model) = env::var(ENV_GENERATION_MODEL) {
            self.generation.model = model;
        }
    }

    /// Validate all sub-configs.
    pub fn validate(&self) -> ConfigResult<()> {
        self.scheduler.validate()?;
        self.analysis.validate()?;
        self.stability.validate()?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let cfg = CoordinationConfig::default();
        cfg.validate().expect("default config should be valid");
        assert_eq!(cfg.scheduler.max_concurrent_requests, 3);
        assert_eq!(cfg.scheduler.retry_policy().max_retries, 3);
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.model("gpt-3.5-turbo").max_tokens, 300);
        assert_eq!(cfg.model("some-local-model"), &ModelConfig::default());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut cfg = CoordinationConfig::default();
        cfg.scheduler.max_concurrent_requests = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut cfg = CoordinationConfig::default();
        cfg.analysis.medium_confidence = 0.9;
        assert!(cfg.validate().is_err());

        let mut cfg = CoordinationConfig::default();
        cfg.stability.moderate_similarity = 0.95;
        assert!(cfg.validate().is_err());

        let mut cfg = CoordinationConfig::default();
        cfg.analysis.contradiction_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [scheduler]
            max_concurrent_requests = 2
            retry_delay_ms = 250

            [stability]
            high_similarity = 0.85
        "#;
        let cfg: CoordinationConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.scheduler.max_concurrent_requests, 2);
        assert_eq!(cfg.scheduler.retry_delay_ms, 250);
        assert_eq!(cfg.scheduler.max_retries, 3);
        assert!(cfg.scheduler.models.contains_key("gpt-4"));
        assert_eq!(cfg.stability.high_similarity, 0.85);
        assert_eq!(cfg.stability.moderate_similarity, 0.7);
        assert_eq!(cfg.analysis.model, "gpt-4");
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let err = CoordinationConfig::from_toml_str("scheduler = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
