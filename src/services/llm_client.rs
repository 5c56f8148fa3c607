use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::metrics::LLM_REQUESTS_TOTAL;
use crate::utils::retry::{retry_async_if, RetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,
    #[error("LLM connection failed: {0}")]
    Connection(String),
    #[error("LLM rate limited")]
    RateLimited,
    #[error("LLM server error: {0}")]
    Server(String),
    #[error("LLM authentication failed")]
    Auth,
    #[error("LLM rejected request: {0}")]
    BadRequest(String),
    #[error("LLM response malformed: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Timeouts, connection drops, rate limits and 5xx are worth retrying;
    /// auth and bad-request failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::Connection(_) | LlmError::RateLimited | LlmError::Server(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String, LlmError>;
}

/// Chat-completions client against an OpenAI-style gateway.
pub struct HttpLlmClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            retry: RetryConfig::llm_gateway(config.max_retries),
        })
    }

    async fn complete_once(
        &self,
        prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = json!({
            "model": opts.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Connection(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => LlmError::Auth,
                429 => LlmError::RateLimited,
                400 => {
                    let detail = response.text().await.unwrap_or_default();
                    LlmError::BadRequest(detail)
                }
                _ => LlmError::Server(format!("status {}", status)),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String, LlmError> {
        let result = retry_async_if(
            self.retry.clone(),
            || self.complete_once(prompt, opts),
            |err: &LlmError| {
                if err.is_retryable() {
                    tracing::warn!(error = %err, "LLM call failed, will retry");
                    true
                } else {
                    false
                }
            },
        )
        .await;

        let outcome = if result.is_ok() { "success" } else { "error" };
        LLM_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();

        result
    }
}

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("valid code fence regex");
}

/// Models often wrap JSON output in a markdown code fence; strip it before
/// parsing.
pub fn strip_code_fence(raw: &str) -> String {
    match CODE_FENCE.captures(raw) {
        Some(caps) => caps[1].to_string(),
        None => raw.trim().to_string(),
    }
}
