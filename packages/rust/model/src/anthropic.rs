//! Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use skillfactory_shared::{ModelConfig, Result, SkillFactoryError};

use crate::retry::is_retryable_status;
use crate::{ModelClient, ModelError, ModelRequest, ModelResponse, ModelTier, is_credit_message};

const API_VERSION: &str = "2023-06-01";

/// Max chars of an error body kept in messages.
const ERROR_BODY_LIMIT: usize = 300;

/// Production [`ModelClient`] over `POST /v1/messages`.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    light_model: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: UsageBlock,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct UsageBlock {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicClient {
    pub fn new(config: &ModelConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SkillFactoryError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            light_model: config.light_model.clone(),
        })
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn model_id(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.model,
            ModelTier::Light => &self.light_model,
        }
    }

    async fn generate(&self, request: &ModelRequest) -> std::result::Result<ModelResponse, ModelError> {
        let body = json!({
            "model": self.model_id(request.tier),
            "max_tokens": request.max_tokens,
            "temperature": 0.0,
            "system": request.system,
            "messages": [{"role": "user", "content": request.user}],
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transient {
                status: None,
                message: e.to_string(),
                retry_after: None,
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            let message = truncate(&text, ERROR_BODY_LIMIT);
            tracing::debug!(status, %message, "model API error");

            return Err(if status == 402 || is_credit_message(&text) {
                ModelError::Credit(message)
            } else if is_retryable_status(status) {
                ModelError::Transient {
                    status: Some(status),
                    message,
                    retry_after,
                }
            } else {
                ModelError::Api { status, message }
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;

        let text: String = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect();

        Ok(ModelResponse {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
