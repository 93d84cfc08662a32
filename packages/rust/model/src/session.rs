//! Model session: cache, retry, credit breaker and usage accounting around
//! a [`ModelClient`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use skillfactory_shared::{Result, SkillFactoryError};
use skillfactory_storage::{CachedResponse, Storage};
use tokio::sync::Mutex;

use crate::json::extract_json;
use crate::pricing::estimate_cost_usd;
use crate::retry::RetryPolicy;
use crate::{ModelClient, ModelError, ModelRequest, ModelTier};

/// Running totals for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    pub calls: u64,
    pub cache_hits: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Usage accrued since an earlier snapshot.
    pub fn since(&self, earlier: &Usage) -> Usage {
        Usage {
            calls: self.calls.saturating_sub(earlier.calls),
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            cost_usd: (self.cost_usd - earlier.cost_usd).max(0.0),
        }
    }
}

/// Cache key: sha256 of system + user prompt.
pub fn request_hash(request: &ModelRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.system.as_bytes());
    hasher.update(request.user.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One session per run. Calls are issued one at a time.
pub struct ModelSession {
    client: Arc<dyn ModelClient>,
    cache: Option<Arc<Storage>>,
    retry: RetryPolicy,
    max_credit_errors: u32,
    credit_errors: AtomicU32,
    usage: Mutex<Usage>,
}

impl ModelSession {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            cache: None,
            retry: RetryPolicy::default(),
            max_credit_errors: 3,
            credit_errors: AtomicU32::new(0),
            usage: Mutex::new(Usage::default()),
        }
    }

    pub fn with_cache(mut self, storage: Arc<Storage>) -> Self {
        self.cache = Some(storage);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_credit_errors(mut self, max: u32) -> Self {
        self.max_credit_errors = max.max(1);
        self
    }

    pub fn model_id(&self, tier: ModelTier) -> &str {
        self.client.model_id(tier)
    }

    /// Snapshot of the running totals.
    pub async fn usage(&self) -> Usage {
        self.usage.lock().await.clone()
    }

    /// Issue a request and return the raw text.
    ///
    /// Transient failures are retried per the [`RetryPolicy`]. Billing errors
    /// are not retried; once `max_credit_errors` of them occur in a row the
    /// call fails with [`SkillFactoryError::CreditExhausted`].
    pub async fn call(&self, request: &ModelRequest) -> Result<String> {
        let model_id = self.client.model_id(request.tier).to_string();
        let key = request_hash(request);

        if let Some(cache) = &self.cache {
            match cache.get_cached_response(&key, &model_id).await {
                Ok(Some(hit)) => {
                    tracing::debug!(key = &key[..16], "model cache hit");
                    self.usage.lock().await.cache_hits += 1;
                    return Ok(hit.text);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "model cache lookup failed"),
            }
        }

        let mut attempt = 0;
        loop {
            let error = match self.client.generate(request).await {
                Ok(response) => {
                    self.credit_errors.store(0, Ordering::Relaxed);
                    let cost =
                        estimate_cost_usd(&model_id, response.input_tokens, response.output_tokens);
                    {
                        let mut usage = self.usage.lock().await;
                        usage.calls += 1;
                        usage.input_tokens += response.input_tokens;
                        usage.output_tokens += response.output_tokens;
                        usage.cost_usd += cost;
                    }
                    tracing::debug!(
                        model = %model_id,
                        input_tokens = response.input_tokens,
                        output_tokens = response.output_tokens,
                        cost_usd = cost,
                        "model call complete"
                    );

                    if let Some(cache) = &self.cache {
                        let entry = CachedResponse {
                            text: response.text.clone(),
                            input_tokens: response.input_tokens,
                            output_tokens: response.output_tokens,
                        };
                        if let Err(e) = cache.set_cached_response(&key, &model_id, &entry).await {
                            tracing::warn!(error = %e, "failed to cache model response");
                        }
                    }
                    return Ok(response.text);
                }
                Err(e) => e,
            };

            match error {
                ModelError::Credit(message) => {
                    let count = self.credit_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(count, max = self.max_credit_errors, %message, "model billing error");
                    if count >= self.max_credit_errors {
                        return Err(SkillFactoryError::CreditExhausted(format!(
                            "{count} consecutive billing errors, add credits and resume: {message}"
                        )));
                    }
                    return Err(SkillFactoryError::Model(format!("billing error: {message}")));
                }
                ModelError::Transient { retry_after, .. } if attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt, retry_after);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient model error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                ModelError::Transient { .. } => {
                    return Err(SkillFactoryError::Model(format!(
                        "giving up after {} attempts: {error}",
                        attempt + 1
                    )));
                }
                other => return Err(SkillFactoryError::Model(other.to_string())),
            }
        }
    }

    /// Issue a request and parse the response as JSON.
    pub async fn call_json(&self, request: &ModelRequest) -> Result<Value> {
        let text = self.call(request).await?;
        extract_json(&text)
    }

    /// Issue a request and deserialize the JSON response into `T`.
    pub async fn call_json_as<T: DeserializeOwned>(&self, request: &ModelRequest) -> Result<T> {
        let value = self.call_json(request).await?;
        serde_json::from_value(value)
            .map_err(|e| SkillFactoryError::parse(format!("unexpected response shape: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::ModelResponse;

    /// Replays a fixed script of results.
    struct Scripted {
        script: std::sync::Mutex<VecDeque<std::result::Result<ModelResponse, ModelError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<std::result::Result<ModelResponse, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        fn model_id(&self, tier: ModelTier) -> &str {
            match tier {
                ModelTier::Primary => "claude-sonnet-test",
                ModelTier::Light => "claude-haiku-test",
            }
        }

        async fn generate(
            &self,
            _request: &ModelRequest,
        ) -> std::result::Result<ModelResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Decode("script exhausted".into())))
        }
    }

    fn ok(text: &str) -> std::result::Result<ModelResponse, ModelError> {
        Ok(ModelResponse {
            text: text.into(),
            input_tokens: 1000,
            output_tokens: 100,
        })
    }

    fn transient() -> std::result::Result<ModelResponse, ModelError> {
        Err(ModelError::Transient {
            status: Some(529),
            message: "overloaded".into(),
            retry_after: None,
        })
    }

    fn credit() -> std::result::Result<ModelResponse, ModelError> {
        Err(ModelError::Credit("credit balance is too low".into()))
    }

    fn session(client: Arc<Scripted>) -> ModelSession {
        ModelSession::new(client).with_retry(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let client = Scripted::new(vec![transient(), transient(), ok("done")]);
        let session = session(client.clone());
        let text = session.call(&ModelRequest::new("s", "u")).await.unwrap();
        assert_eq!(text, "done");
        assert_eq!(client.calls(), 3);

        let usage = session.usage().await;
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.total_tokens(), 1100);
        assert!((usage.cost_usd - (1000.0 * 3.0 + 100.0 * 15.0) / 1e6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let client = Scripted::new(vec![transient(), transient(), transient(), ok("late")]);
        let session = session(client.clone());
        let err = session.call(&ModelRequest::new("s", "u")).await.unwrap_err();
        assert!(matches!(err, SkillFactoryError::Model(_)));
        assert!(!err.is_fatal());
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn consecutive_credit_errors_trip_breaker() {
        let client = Scripted::new(vec![credit(), credit(), credit()]);
        let session = session(client);
        let req = ModelRequest::new("s", "u");

        assert!(!session.call(&req).await.unwrap_err().is_fatal());
        assert!(!session.call(&req).await.unwrap_err().is_fatal());
        let third = session.call(&req).await.unwrap_err();
        assert!(third.is_fatal());
        assert!(matches!(third, SkillFactoryError::CreditExhausted(_)));
    }

    #[tokio::test]
    async fn success_resets_credit_counter() {
        let client = Scripted::new(vec![credit(), credit(), ok("fine"), credit(), credit()]);
        let session = session(client);
        let req = ModelRequest::new("s", "u");

        session.call(&req).await.unwrap_err();
        session.call(&req).await.unwrap_err();
        session.call(&req).await.unwrap();
        assert!(!session.call(&req).await.unwrap_err().is_fatal());
        assert!(!session.call(&req).await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn cache_hit_skips_the_client() {
        let db = std::env::temp_dir().join(format!("sf_cache_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db).await.unwrap());
        let client = Scripted::new(vec![ok("{\"n\": 1}")]);
        let session = session(client.clone()).with_cache(storage);
        let req = ModelRequest::new("system", "user");

        let first = session.call_json(&req).await.unwrap();
        let second = session.call_json(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.calls(), 1);
        assert_eq!(session.usage().await.cache_hits, 1);
    }

    #[tokio::test]
    async fn call_json_as_reports_shape_errors() {
        #[derive(serde::Deserialize)]
        struct Shape {
            #[allow(dead_code)]
            topics: Vec<String>,
        }
        let client = Scripted::new(vec![ok("```json\n{\"topics\": 3}\n```")]);
        let session = session(client);
        let err = session
            .call_json_as::<Shape>(&ModelRequest::new("s", "u"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SkillFactoryError::Parse { .. }));
    }

    #[test]
    fn usage_delta() {
        let before = Usage {
            calls: 2,
            input_tokens: 100,
            cost_usd: 0.5,
            ..Usage::default()
        };
        let after = Usage {
            calls: 5,
            input_tokens: 400,
            cost_usd: 1.25,
            ..Usage::default()
        };
        let delta = after.since(&before);
        assert_eq!(delta.calls, 3);
        assert_eq!(delta.input_tokens, 300);
        assert!((delta.cost_usd - 0.75).abs() < 1e-12);
    }

    #[test]
    fn hash_depends_on_both_prompts() {
        let a = request_hash(&ModelRequest::new("sys", "one"));
        let b = request_hash(&ModelRequest::new("sys", "two"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
