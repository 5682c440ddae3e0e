//! Sub-call router (§4.E): resolves an `LMRequest` to a registered backend,
//! enforces the two-tier token budget (root vs. sub), and dispatches.
//!
//! Distinct from the REPL's view of it: the REPL only ever sees the
//! [`SubCallDispatcher`] capability, never the router's registry or budget
//! state, so a sub-call cannot reach back up to reconfigure the thing that
//! is metering it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{with_retry, SharedBackend};
use crate::error::{BudgetExceededError, BudgetType, Result, RlmError};
use crate::types::{ChatCompletion, LMRequest, LMResponse, ModelPreferences, PromptPayload, Usage};

/// One-way capability the REPL environment holds: submit a request, get a
/// response back. Implemented by [`SubCallRouter`] in production and by
/// [`MockDispatcher`] in tests.
#[async_trait]
pub trait SubCallDispatcher: Send + Sync {
    async fn dispatch(&self, request: LMRequest) -> Result<LMResponse>;
}

/// Router tuning: the default backend name and the two token ceilings
/// (§5 "two-tier budget ceilings").
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_backend: String,
    pub max_root_tokens: u64,
    pub max_sub_tokens: u64,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_backend: String::new(),
            max_root_tokens: u64::MAX,
            max_sub_tokens: u64::MAX,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
struct UsageCounters {
    root_tokens: u64,
    sub_tokens: u64,
}

/// Routes `LMRequest`s to registered backends by preference, metering token
/// usage against per-scope budget ceilings.
pub struct SubCallRouter {
    backends: HashMap<String, SharedBackend>,
    config: RouterConfig,
    usage: Mutex<UsageCounters>,
}

impl SubCallRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            backends: HashMap::new(),
            config,
            usage: Mutex::new(UsageCounters::default()),
        }
    }

    pub fn register_backend(&mut self, backend: SharedBackend) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Backend selection (§4.E): exact id, then the candidates list in
    /// order, then a substring/family match, then the configured default.
    /// An explicit, unresolvable hint is a hard failure — no silent
    /// fallback to the default.
    fn resolve(&self, preferences: Option<&ModelPreferences>) -> Result<&SharedBackend> {
        let Some(prefs) = preferences.filter(|p| !p.is_empty()) else {
            return self.default_backend();
        };

        for exact in [&prefs.model, &prefs.model_name, &prefs.preferred_model]
            .into_iter()
            .flatten()
        {
            if let Some(backend) = self.backends.get(exact) {
                return Ok(backend);
            }
        }

        if let Some(candidates) = &prefs.candidates {
            for candidate in candidates {
                if let Some(backend) = self.backends.get(candidate) {
                    return Ok(backend);
                }
            }
        }

        if let Some(needle) = &prefs.contains {
            if let Some(backend) = self
                .backends
                .values()
                .find(|b| b.name().contains(needle.as_str()))
            {
                return Ok(backend);
            }
        }

        if let Some(family) = &prefs.family {
            if let Some(backend) = self
                .backends
                .values()
                .find(|b| b.family() == Some(family.as_str()))
            {
                return Ok(backend);
            }
        }

        let had_explicit_name = prefs.model.is_some()
            || prefs.model_name.is_some()
            || prefs.preferred_model.is_some()
            || prefs.candidates.as_ref().is_some_and(|c| !c.is_empty());
        if had_explicit_name {
            return Err(RlmError::ResolutionFailure(format!(
                "no registered backend matched preferences: {prefs:?}"
            )));
        }

        self.default_backend()
    }

    fn default_backend(&self) -> Result<&SharedBackend> {
        self.backends.get(&self.config.default_backend).ok_or_else(|| {
            RlmError::ResolutionFailure(format!(
                "default backend '{}' is not registered",
                self.config.default_backend
            ))
        })
    }

    fn budget_for_depth(depth: u32) -> BudgetType {
        if depth == 0 {
            BudgetType::RootTokens
        } else {
            BudgetType::SubTokens
        }
    }

    fn check_and_record(&self, depth: u32, usage: &Usage) -> Result<()> {
        let budget_type = Self::budget_for_depth(depth);
        let limit = if depth == 0 {
            self.config.max_root_tokens
        } else {
            self.config.max_sub_tokens
        };
        let mut counters = self.usage.lock().expect("router usage lock poisoned");
        let current = if depth == 0 {
            counters.root_tokens
        } else {
            counters.sub_tokens
        };
        let projected = current + usage.total();
        if projected > limit {
            return Err(RlmError::BudgetExceeded(BudgetExceededError {
                budget_type,
                limit,
                actual: projected,
            }));
        }
        if depth == 0 {
            counters.root_tokens = projected;
        } else {
            counters.sub_tokens = projected;
        }
        Ok(())
    }

    async fn complete_one(&self, prompt: &PromptPayload, request: &LMRequest) -> Result<ChatCompletion> {
        let backend = self.resolve(request.model_preferences.as_ref())?;
        let completion = with_retry(
            self.config.retry_attempts,
            self.config.retry_backoff,
            backend.name(),
            || backend.complete(prompt, request.model_preferences.as_ref()),
        )
        .await?;
        self.check_and_record(request.depth, &completion.usage)?;
        Ok(completion)
    }

    pub async fn complete_single(&self, request: LMRequest) -> Result<LMResponse> {
        let completion = self.complete_one(&request.prompt, &request).await?;
        Ok(LMResponse::single(completion))
    }

    pub async fn complete_batched(&self, request: LMRequest) -> Result<LMResponse> {
        let prompts = request
            .prompt
            .as_batch()
            .ok_or_else(|| RlmError::InvalidRequest("batched request carries no batch payload".into()))?
            .to_vec();
        let mut completions = Vec::with_capacity(prompts.len());
        for text in prompts {
            let payload = PromptPayload::Text(text);
            completions.push(self.complete_one(&payload, &request).await?);
        }
        Ok(LMResponse::batched(completions))
    }

    /// Streaming completion for root-iteration calls whose backend declares
    /// support; falls back to non-streamed completion otherwise.
    pub async fn stream_completion(
        &self,
        request: LMRequest,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<LMResponse> {
        let backend = self.resolve(request.model_preferences.as_ref())?;
        if !backend.supports_streaming() {
            return self.complete_single(request).await;
        }
        let completion = backend
            .stream_complete(&request.prompt, request.model_preferences.as_ref(), on_chunk)
            .await?;
        self.check_and_record(request.depth, &completion.usage)?;
        Ok(LMResponse::single(completion))
    }
}

#[async_trait]
impl SubCallDispatcher for SubCallRouter {
    async fn dispatch(&self, request: LMRequest) -> Result<LMResponse> {
        if request.is_batched {
            self.complete_batched(request).await
        } else {
            self.complete_single(request).await
        }
    }
}

/// Deterministic dispatcher for tests: returns pre-configured responses in
/// order, logging every request it receives.
pub struct MockDispatcher {
    responses: Mutex<Vec<LMResponse>>,
    requests: Mutex<Vec<LMRequest>>,
}

impl MockDispatcher {
    pub fn new(responses: Vec<LMResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LMRequest> {
        self.requests.lock().expect("mock dispatcher lock poisoned").clone()
    }
}

#[async_trait]
impl SubCallDispatcher for MockDispatcher {
    async fn dispatch(&self, request: LMRequest) -> Result<LMResponse> {
        self.requests
            .lock()
            .expect("mock dispatcher lock poisoned")
            .push(request);
        let mut responses = self.responses.lock().expect("mock dispatcher lock poisoned");
        if responses.is_empty() {
            return Ok(LMResponse::error("mock dispatcher exhausted"));
        }
        Ok(responses.remove(0))
    }
}
