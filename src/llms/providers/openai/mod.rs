//! OpenAI-compatible chat completions backend.
//!
//! Works against api.openai.com or any server exposing the same
//! `/chat/completions` endpoint (set `OPENAI_BASE_URL`).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llms::base_llm::{BaseLLM, LLMError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Stop sequence that keeps the model from inventing tool observations.
const OBSERVATION_STOP: &str = "\nObservation:";

/// Chat completions client over `reqwest`.
#[derive(Debug, Clone)]
pub struct OpenAICompletion {
    pub model: String,
    api_key: Option<String>,
    pub base_url: String,
    pub temperature: Option<f64>,
    /// Retries on 429, 5xx and network errors before giving up.
    pub max_retries: u32,
    client: reqwest::Client,
}

impl OpenAICompletion {
    /// Create a client for `model`, reading `OPENAI_API_KEY` and
    /// `OPENAI_BASE_URL` from the environment.
    ///
    /// # Arguments
    /// * `model` - Model name; `gpt-4o-mini` when `None`.
    /// * `timeout_secs` - Per-request timeout.
    pub fn new(model: Option<&str>, timeout_secs: f64) -> Result<Self, LLMError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_secs))
            .build()
            .map_err(|e| LLMError::Rejected(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            temperature: Some(0.2),
            max_retries: 2,
            client,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Request body for a single-turn prompt.
    pub fn build_request_body(&self, prompt: &str, tools_allowed: &[String]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(temp) = self.temperature {
            body["temperature"] = json!(temp);
        }
        if !tools_allowed.is_empty() {
            body["stop"] = json!([OBSERVATION_STOP]);
        }
        body
    }

    /// Extract the completion text from a response body.
    pub fn parse_completion(response: &Value) -> Result<String, LLMError> {
        let choice = response
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LLMError::Transient("no choices in response".to_string()))?;

        if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
            return Err(LLMError::ContentPolicy("completion stopped by content filter".to_string()));
        }

        let message = choice
            .get("message")
            .ok_or_else(|| LLMError::Transient("no message in choice".to_string()))?;
        if let Some(refusal) = message.get("refusal").and_then(Value::as_str) {
            return Err(LLMError::ContentPolicy(refusal.to_string()));
        }

        if let Some(usage) = response.get("usage") {
            log::debug!(
                "token usage: prompt={}, completion={}, total={}",
                usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0),
                usage.get("completion_tokens").and_then(Value::as_i64).unwrap_or(0),
                usage.get("total_tokens").and_then(Value::as_i64).unwrap_or(0),
            );
        }

        Ok(message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Classify a non-success client error body.
    fn classify_client_error(status: reqwest::StatusCode, body: &str) -> LLMError {
        let lowered = body.to_lowercase();
        if lowered.contains("content_policy") || lowered.contains("content_filter") {
            LLMError::ContentPolicy(format!("({}) {}", status, truncate(body)))
        } else {
            LLMError::Rejected(format!("({}) {}", status, truncate(body)))
        }
    }
}

fn truncate(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(500)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

#[async_trait]
impl BaseLLM for OpenAICompletion {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, tools_allowed: &[String]) -> Result<String, LLMError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            LLMError::Rejected("OpenAI API key not set. Set the OPENAI_API_KEY environment variable.".to_string())
        })?;

        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.build_request_body(prompt, tools_allowed);
        log::debug!("generate: model={}, prompt_chars={}", self.model, prompt.len());

        let mut last_error = String::from("no attempt made");
        let mut retry_delay = Duration::from_secs(1);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                log::warn!("OpenAI API retry attempt {} after {:?}: {}", attempt, retry_delay, last_error);
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2;
            }

            let response = match self
                .client
                .post(&endpoint)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                last_error = "rate limited (429)".to_string();
                continue;
            }
            if status.is_server_error() {
                last_error = format!("server error: {}", status);
                continue;
            }

            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            if status.is_client_error() {
                return Err(Self::classify_client_error(status, &text));
            }

            let json: Value = serde_json::from_str(&text)
                .map_err(|e| LLMError::Transient(format!("failed to parse response: {} - body: {}", e, truncate(&text))))?;
            return Self::parse_completion(&json);
        }

        Err(LLMError::Transient(last_error))
    }
}
