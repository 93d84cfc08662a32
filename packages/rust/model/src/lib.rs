//! Language-model capability for Skill Factory.
//!
//! Phases talk to a [`ModelSession`], which wraps any [`ModelClient`] with the
//! response cache, retry/backoff, the credit circuit breaker and usage
//! accounting. [`AnthropicClient`] is the production client.

pub mod anthropic;
pub mod json;
pub mod pricing;
pub mod retry;
pub mod session;

use async_trait::async_trait;

pub use anthropic::AnthropicClient;
pub use json::extract_json;
pub use pricing::{ModelPrice, estimate_cost_usd, model_price};
pub use retry::{RetryPolicy, is_retryable_status};
pub use session::{ModelSession, Usage};

/// Which configured model a request should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    /// Main model for audit, extraction and build.
    Primary,
    /// Cheaper model for high-volume work such as deduplication.
    Light,
}

/// A single-turn generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub tier: ModelTier,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 4096,
            tier: ModelTier::Primary,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn light(mut self) -> Self {
        self.tier = ModelTier::Light;
        self
    }
}

/// Text plus token usage returned by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Transport-level failure classification.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Rate limiting, overload, 5xx or connection failure. Retried.
    #[error("transient model error ({}): {message}", status.map_or("network".to_string(), |s| s.to_string()))]
    Transient {
        status: Option<u16>,
        message: String,
        retry_after: Option<u64>,
    },

    /// Billing or quota failure. Counted by the credit breaker.
    #[error("billing error: {0}")]
    Credit(String),

    /// Non-retryable API error (auth, bad request).
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// The external model capability.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Concrete model identifier for a tier, used for pricing and cache keys.
    fn model_id(&self, tier: ModelTier) -> &str;

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

const CREDIT_PHRASES: &[&str] = &[
    "credit balance is too low",
    "insufficient_quota",
    "insufficient credits",
    "payment required",
    "billing hard limit",
    "quota exceeded",
];

/// Whether an error message looks like a billing/credit failure.
pub fn is_credit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    CREDIT_PHRASES.iter().any(|p| lower.contains(p))
}
