//! Survey Agent
//!
//! Runs a [`SurveySession`](survey_coordination::SurveySession) against an
//! OpenAI-compatible chat-completions endpoint:
//! - `provider`: `CompletionProvider` over reqwest
//! - `config`: environment-driven endpoint, context and settings files
//! - `transport`: JSON-lines stdin/stdout event stream

pub mod config;
pub mod provider;
pub mod transport;

pub use config::{AgentConfig, Endpoint};
pub use provider::OpenAiCompatProvider;
pub use transport::{read_events, write_events, TransportError, TransportResult};
