//! Test double for the model capability.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use skillfactory_model::{
    ModelClient, ModelError, ModelRequest, ModelResponse, ModelSession, ModelTier, RetryPolicy,
};

type Responder = Box<dyn Fn(&ModelRequest) -> String + Send + Sync>;

/// Replays queued replies, then falls back to a responder function.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    credit_errors: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            responder: None,
            credit_errors: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn responding(f: impl Fn(&ModelRequest) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            credit_errors: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every call fails with a billing error.
    pub fn credit_exhausted() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            responder: None,
            credit_errors: true,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// A session with no retries or cache.
    pub fn session(self: &Arc<Self>) -> ModelSession {
        ModelSession::new(self.clone()).with_retry(RetryPolicy::immediate(1))
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_id(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => "claude-sonnet-test",
            ModelTier::Light => "claude-haiku-test",
        }
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if self.credit_errors {
            return Err(ModelError::Credit("credit balance is too low".into()));
        }
        let queued = self.replies.lock().unwrap().pop_front();
        let text = match (queued, &self.responder) {
            (Some(text), _) => text,
            (None, Some(f)) => f(request),
            (None, None) => return Err(ModelError::Decode("script exhausted".into())),
        };
        Ok(ModelResponse {
            text,
            input_tokens: 100,
            output_tokens: 50,
        })
    }
}
