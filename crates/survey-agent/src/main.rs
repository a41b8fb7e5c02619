//! Survey agent: JSON-lines survey analysis over stdio
//!
//! Reads inbound events from stdin, writes outbound events to stdout and
//! logs to stderr.
//!
//! # Usage
//!
//! ```bash
//! SURVEY_LLM_BASE_URL=http://localhost:8000/v1 \
//! SURVEY_CONTEXT_FILE=./contexts.json \
//!     survey-agent --context-id context2 < events.jsonl
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use survey_agent::{read_events, write_events, AgentConfig, OpenAiCompatProvider};
use survey_coordination::{EventSink, SurveySession};
use tokio::io::BufReader;
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Chat-completions base URL (overrides SURVEY_LLM_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// JSON file of named survey contexts (overrides SURVEY_CONTEXT_FILE)
    #[arg(long)]
    context_file: Option<PathBuf>,

    /// Survey context to start with (overrides SURVEY_CONTEXT_ID)
    #[arg(long)]
    context_id: Option<String>,

    /// TOML coordination settings (overrides SURVEY_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Concurrent provider calls (overrides the configured pool size)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut agent = AgentConfig::from_env();
    if let Some(url) = args.base_url {
        agent.endpoint.base_url = url;
    }
    if let Some(path) = args.context_file {
        agent.context_file = Some(path);
    }
    if let Some(id) = args.context_id {
        agent.context_id = id;
    }
    if let Some(path) = args.config {
        agent.config_file = Some(path);
    }

    let mut coordination = agent.coordination()?;
    if let Some(workers) = args.workers {
        coordination.scheduler.max_concurrent_requests = workers;
        coordination.validate()?;
    }
    let (catalog, context) = agent.contexts()?;

    info!(
        endpoint = %agent.endpoint.chat_completions_url(),
        workers = coordination.scheduler.max_concurrent_requests,
        analysis_model = %coordination.analysis.model,
        "Survey agent starting"
    );

    let provider = Arc::new(
        OpenAiCompatProvider::new(agent.endpoint.clone()).context("Failed to build HTTP client")?,
    );
    let (sink, events) = EventSink::channel();
    let session = SurveySession::new(provider, coordination, context, sink).with_catalog(catalog);

    let writer = tokio::spawn(write_events(events, tokio::io::stdout()));
    let handled = read_events(BufReader::new(tokio::io::stdin()), &session).await?;
    info!(handled, "Input closed, finishing pending work");

    session.shutdown().await;
    drop(session);
    let written = writer.await.context("Event writer task failed")??;
    info!(written, "Survey agent stopped");
    Ok(())
}
