//! OpenAI-compatible embeddings client.
//!
//! Single attempt per call: retry policy belongs to the caller, so this
//! client only classifies failures as retryable or fatal.

use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{prepare_input, EmbeddingError, TextEmbedder};
use crate::config::EmbeddingConfig;

/// Environment variable consulted when the config carries no key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    send_dimensions: bool,
    max_input_chars: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: usize,
        timeout: Duration,
        max_input_chars: usize,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        anyhow::ensure!(dimensions > 0, "embedding dimensions must be positive");

        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embeddings HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimensions,
            // only the v3 family accepts a `dimensions` parameter
            send_dimensions: model.starts_with("text-embedding-3"),
            max_input_chars,
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .with_context(|| {
                format!("OpenAI key not set: add embedding.api_key to config or export {API_KEY_ENV}")
            })?;

        Self::new(
            &api_key,
            &config.base_url,
            &config.model,
            config.dimensions,
            Duration::from_secs(config.timeout_secs),
            config.max_input_chars,
        )
    }
}

impl TextEmbedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = prepare_input(text, self.max_input_chars)?;

        let request = EmbeddingRequest {
            model: &self.model,
            input,
            dimensions: self.send_dimensions.then_some(self.dimensions),
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(classify_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, &body));
        }

        let parsed: EmbeddingResponse = resp.json().map_err(|err| {
            EmbeddingError::fatal(format!("failed to parse embeddings response: {err}"))
        })?;

        parsed
            .data
            .into_iter()
            .min_by_key(|entry| entry.index)
            .map(|entry| entry.embedding)
            .ok_or_else(|| EmbeddingError::fatal("provider returned no embedding"))
    }
}

fn classify_transport_error(err: reqwest::Error) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::retryable(format!("request timed out: {err}"))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        EmbeddingError::retryable(format!("request failed: {err}"))
    } else {
        EmbeddingError::fatal(format!("request failed: {err}"))
    }
}

/// Maps a non-success HTTP response to a provider error.
///
/// 429 is a rate limit and retryable, except when the body reports an
/// exhausted quota, which no amount of waiting fixes.
pub fn classify_status(status: StatusCode, body: &str) -> EmbeddingError {
    let detail = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let message = match &detail {
        Some(detail) => format!("{} ({status})", detail.message),
        None => format!("{status}: {body}"),
    };

    let quota_exhausted = detail
        .as_ref()
        .and_then(|d| d.code.as_deref().or(d.kind.as_deref()))
        .map(|code| code == "insufficient_quota")
        .unwrap_or(false);

    let retryable = match status {
        StatusCode::TOO_MANY_REQUESTS => !quota_exhausted,
        StatusCode::REQUEST_TIMEOUT => true,
        s if s.is_server_error() => true,
        _ => false,
    };

    EmbeddingError::Provider { retryable, message }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
}
