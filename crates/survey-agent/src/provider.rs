//! Completion provider for OpenAI-compatible `/chat/completions` endpoints.
//!
//! | Failure                               | `ProviderErrorKind` |
//! |---------------------------------------|---------------------|
//! | HTTP 429                              | `RateLimited`       |
//! | HTTP 5xx, connection/body errors      | `Transport`         |
//! | reqwest request timeout               | `Timeout`           |
//! | other 4xx, unparsable or empty body   | `Rejected`          |

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use survey_coordination::scheduler::{TokenLogprob, Usage};
use survey_coordination::{ChatMessage, Completion, CompletionProvider, ModelParams, ProviderError};
use tracing::debug;

use crate::config::Endpoint;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    logprobs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<u8>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    content: Option<Vec<TokenLogprob>>,
}

/// Map a non-success HTTP status to a provider error.
pub fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::rate_limited(message)
    } else if status.is_server_error() {
        ProviderError::transport(message)
    } else {
        ProviderError::rejected(message)
    }
}

fn classify_reqwest(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(err.to_string())
    } else {
        ProviderError::transport(err.to_string())
    }
}

/// Parse a chat-completions response body.
pub fn parse_chat_response(body: &str) -> Result<Completion, ProviderError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::rejected(format!("unparsable response body: {e}")))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::rejected("response contained no choices"))?;

    let mut completion = Completion::text(choice.message.content.unwrap_or_default());
    if let Some(tokens) = choice.logprobs.and_then(|l| l.content) {
        completion = completion.with_logprobs(tokens);
    }
    if let Some(usage) = response.usage {
        completion = completion.with_usage(usage);
    }
    Ok(completion)
}

pub struct OpenAiCompatProvider {
    endpoint: Endpoint,
    url: String,
    http: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(endpoint: Endpoint) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(endpoint.request_timeout)
            .build()?;
        Ok(Self {
            url: endpoint.chat_completions_url(),
            endpoint,
            http,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
    ) -> Result<Completion, ProviderError> {
        let request = ChatRequest {
            model: &params.model,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            logprobs: params.logprobs,
            top_logprobs: params.top_logprobs,
        };

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(classify_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_reqwest)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let completion = parse_chat_response(&body)?;
        debug!(
            model = %params.model,
            chars = completion.content.len(),
            total_tokens = completion.usage.map(|u| u.total_tokens).unwrap_or(0),
            "Chat completion received"
        );
        Ok(completion)
    }
}
