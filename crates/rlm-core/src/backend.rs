//! LM backend abstraction (§9 design note: "dynamic dispatch for LM
//! backends" — a small interface `{name, family, complete, batched,
//! supports_streaming?}" with a pure `name -> backend` factory held by the
//! router's registry, not by a singleton).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, RlmError};
use crate::types::{ChatCompletion, ModelPreferences, PromptPayload};

/// Execute an async operation with exponential backoff retry. Retries only
/// `TransientTransport` errors; every other kind is returned immediately
/// (§4.F failure modes).
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    backend_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                if attempt < max_retries {
                    tracing::warn!(
                        backend = backend_name,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "sub-call transport error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap())
}

/// A single streamed chunk of text, or the final assembled completion.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done(ChatCompletion),
}

/// A named LM backend. Implementations speak to a specific provider; the
/// core never implements a concrete one (out of scope — §1).
#[async_trait]
pub trait LLMBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Optional family grouping (e.g. "claude", "gpt") consulted by the
    /// router's substring/family resolution step.
    fn family(&self) -> Option<&str> {
        None
    }

    async fn complete(
        &self,
        prompt: &PromptPayload,
        preferences: Option<&ModelPreferences>,
    ) -> Result<ChatCompletion>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Streaming completion; callback is invoked on each text chunk. Default
    /// implementation rejects the call — only backends declaring
    /// `supports_streaming() == true` should override this.
    async fn stream_complete(
        &self,
        prompt: &PromptPayload,
        preferences: Option<&ModelPreferences>,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ChatCompletion> {
        let _ = on_chunk;
        let _ = preferences;
        let _ = prompt;
        Err(RlmError::BackendFailure(format!(
            "{} does not support streaming",
            self.name()
        )))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Shareable handle to a backend.
pub type SharedBackend = Arc<dyn LLMBackend>;

/// Deterministic backend for tests: returns pre-configured completions in
/// order, logging every request it receives.
pub struct MockBackend {
    name: String,
    family: Option<String>,
    responses: Mutex<Vec<ChatCompletion>>,
    request_log: Mutex<Vec<PromptPayload>>,
}

impl MockBackend {
    pub fn new(name: impl Into<String>, responses: Vec<ChatCompletion>) -> Self {
        Self {
            name: name.into(),
            family: None,
            responses: Mutex::new(responses),
            request_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn requests(&self) -> Vec<PromptPayload> {
        self.request_log.lock().expect("mock backend lock poisoned").clone()
    }

    pub fn request_count(&self) -> usize {
        self.request_log.lock().expect("mock backend lock poisoned").len()
    }
}

#[async_trait]
impl LLMBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    async fn complete(
        &self,
        prompt: &PromptPayload,
        _preferences: Option<&ModelPreferences>,
    ) -> Result<ChatCompletion> {
        self.request_log
            .lock()
            .expect("mock backend lock poisoned")
            .push(prompt.clone());
        let mut responses = self.responses.lock().expect("mock backend lock poisoned");
        if responses.is_empty() {
            return Err(RlmError::BackendFailure(format!(
                "{}: no more mock responses available",
                self.name
            )));
        }
        Ok(responses.remove(0))
    }
}

/// Wraps another backend, logging request/response pairs at debug level.
pub struct LoggingBackend<B: LLMBackend> {
    inner: B,
    name: String,
}

impl<B: LLMBackend> LoggingBackend<B> {
    pub fn new(inner: B) -> Self {
        let name = format!("logging({})", inner.name());
        Self { inner, name }
    }
}

#[async_trait]
impl<B: LLMBackend> LLMBackend for LoggingBackend<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> Option<&str> {
        self.inner.family()
    }

    async fn complete(
        &self,
        prompt: &PromptPayload,
        preferences: Option<&ModelPreferences>,
    ) -> Result<ChatCompletion> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(prompt, preferences).await;
        let elapsed = start.elapsed();
        match &result {
            Ok(completion) => tracing::debug!(
                backend = self.inner.name(),
                model = %completion.model_name,
                tokens = completion.usage.total(),
                duration_ms = elapsed.as_millis() as u64,
                "sub-call completed"
            ),
            Err(e) => tracing::warn!(
                backend = self.inner.name(),
                error = %e,
                duration_ms = elapsed.as_millis() as u64,
                "sub-call failed"
            ),
        }
        result
    }

    fn supports_streaming(&self) -> bool {
        self.inner.supports_streaming()
    }

    async fn stream_complete(
        &self,
        prompt: &PromptPayload,
        preferences: Option<&ModelPreferences>,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ChatCompletion> {
        self.inner.stream_complete(prompt, preferences, on_chunk).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;

    #[tokio::test]
    async fn mock_backend_returns_responses_in_order() {
        let backend = MockBackend::new(
            "mock",
            vec![
                ChatCompletion::new("first", Usage::new(1, 1), "mock"),
                ChatCompletion::new("second", Usage::new(1, 1), "mock"),
            ],
        );
        let p = PromptPayload::Text("hi".into());
        assert_eq!(backend.complete(&p, None).await.unwrap().text, "first");
        assert_eq!(backend.complete(&p, None).await.unwrap().text, "second");
        assert_eq!(backend.request_count(), 2);
    }

    #[tokio::test]
    async fn mock_backend_exhausted_is_backend_failure() {
        let backend = MockBackend::new("mock", vec![]);
        let p = PromptPayload::Text("hi".into());
        let err = backend.complete(&p, None).await.unwrap_err();
        assert!(matches!(err, RlmError::BackendFailure(_)));
    }

    #[tokio::test]
    async fn with_retry_retries_transient_errors_only() {
        let attempts = Mutex::new(0);
        let result: Result<()> = with_retry(2, Duration::from_millis(1), "mock", || {
            let mut n = attempts.lock().unwrap();
            *n += 1;
            async move {
                if *n < 3 {
                    Err(RlmError::TransientTransport("reset".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_non_transient_errors() {
        let attempts = Mutex::new(0);
        let result: Result<()> = with_retry(3, Duration::from_millis(1), "mock", || {
            let mut n = attempts.lock().unwrap();
            *n += 1;
            async move { Err(RlmError::BackendFailure("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), 1);
    }
}
