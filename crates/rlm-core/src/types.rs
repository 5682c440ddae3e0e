//! Wire and data-model types shared by the sub-call router, the REPL
//! environment, and the recursion engine.
//!
//! These mirror the aggregates of the data model: `LMRequest`/`LMResponse`
//! cross the wire codec (socket framing or the isolated-env broker's HTTP
//! framing); `ReplResult`/`Iteration` are produced inside a single turn.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Usage
// ============================================================================

/// Token usage for a single completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

// ============================================================================
// Model preferences (backend selection hints, §4.E)
// ============================================================================

/// Structured hint steering sub-call router backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ModelPreferences {
    pub model: Option<String>,
    pub model_name: Option<String>,
    pub preferred_model: Option<String>,
    pub candidates: Option<Vec<String>>,
    pub contains: Option<String>,
    pub family: Option<String>,
}

impl ModelPreferences {
    pub fn exact(name: impl Into<String>) -> Self {
        Self {
            model: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.model_name.is_none()
            && self.preferred_model.is_none()
            && self.candidates.as_ref().is_none_or(|c| c.is_empty())
            && self.contains.is_none()
            && self.family.is_none()
    }
}

// ============================================================================
// Prompt payload
// ============================================================================

/// A chat-style message, used when a request carries an ordered sequence
/// rather than a single string prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The body of an `LMRequest`: a single prompt, an ordered sequence of chat
/// messages, or (when `is_batched`) an ordered sequence of independent
/// prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum PromptPayload {
    Text(String),
    Messages(Vec<ChatMessage>),
    Batch(Vec<String>),
}

impl PromptPayload {
    pub fn as_batch(&self) -> Option<&[String]> {
        match self {
            PromptPayload::Batch(prompts) => Some(prompts),
            _ => None,
        }
    }
}

// ============================================================================
// LMRequest / LMResponse
// ============================================================================

/// Produced by the REPL environment (C) or the isolated-env broker (D),
/// consumed by the sub-call router (E).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LMRequest {
    pub prompt: PromptPayload,
    #[serde(default)]
    pub is_batched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preferences: Option<ModelPreferences>,
    pub scope_id: String,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_fingerprint: Option<String>,
}

impl LMRequest {
    pub fn single(prompt: impl Into<String>, scope_id: impl Into<String>, depth: u32) -> Self {
        Self {
            prompt: PromptPayload::Text(prompt.into()),
            is_batched: false,
            model_preferences: None,
            scope_id: scope_id.into(),
            depth,
            caller_fingerprint: None,
        }
    }

    pub fn batched(prompts: Vec<String>, scope_id: impl Into<String>, depth: u32) -> Self {
        Self {
            prompt: PromptPayload::Batch(prompts),
            is_batched: true,
            model_preferences: None,
            scope_id: scope_id.into(),
            depth,
            caller_fingerprint: None,
        }
    }

    pub fn with_preferences(mut self, prefs: ModelPreferences) -> Self {
        self.model_preferences = Some(prefs);
        self
    }
}

/// A single completion returned by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletion {
    pub text: String,
    pub usage: Usage,
    pub model_name: String,
}

impl ChatCompletion {
    pub fn new(text: impl Into<String>, usage: Usage, model_name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage,
            model_name: model_name.into(),
        }
    }
}

/// Sum type: exactly one of `chat_completion`, `chat_completions`, `message`.
/// Modeled as a Rust enum so "no variant set" is unrepresentable; see
/// DESIGN.md for why this strengthens spec's invariant rather than loosening
/// it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LMResponse {
    Single { chat_completion: ChatCompletion },
    Batched { chat_completions: Vec<ChatCompletion> },
    Error { message: String },
}

impl LMResponse {
    pub fn single(completion: ChatCompletion) -> Self {
        LMResponse::Single {
            chat_completion: completion,
        }
    }

    /// An empty batch is a valid, non-error response (§3 invariant).
    pub fn batched(completions: Vec<ChatCompletion>) -> Self {
        LMResponse::Batched {
            chat_completions: completions,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        LMResponse::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LMResponse::Error { .. })
    }

    pub fn into_text(self) -> Result<String, String> {
        match self {
            LMResponse::Single { chat_completion } => Ok(chat_completion.text),
            LMResponse::Batched { chat_completions } => Ok(chat_completions
                .into_iter()
                .map(|c| c.text)
                .collect::<Vec<_>>()
                .join("\n")),
            LMResponse::Error { message } => Err(message),
        }
    }
}

// ============================================================================
// REPL execution result
// ============================================================================

/// Result of executing one fenced code block through the REPL environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplResult {
    pub stdout: String,
    pub stderr: String,
    pub error: bool,
    pub sub_call_usage: HashMap<String, Usage>,
}

impl ReplResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            error: false,
            sub_call_usage: HashMap::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            error: true,
            sub_call_usage: HashMap::new(),
        }
    }

    pub fn record_sub_call(&mut self, model_name: &str, usage: Usage) {
        self.sub_call_usage
            .entry(model_name.to_string())
            .or_default()
            .add(&usage);
    }

    pub fn merge(&mut self, other: &ReplResult) {
        self.stdout.push_str(&other.stdout);
        self.stderr.push_str(&other.stderr);
        self.error = self.error || other.error;
        for (model, usage) in &other.sub_call_usage {
            self.sub_call_usage.entry(model.clone()).or_default().add(usage);
        }
    }
}

// ============================================================================
// Iteration
// ============================================================================

/// One executed fenced code block plus its result, in source order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlockExecution {
    pub code: String,
    pub result: ReplResult,
}

/// One LM call plus zero or more code executions within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub index: u32,
    pub prompt_fingerprint: String,
    /// The LM's raw response text for this iteration, fences and all —
    /// needed verbatim to replay the transcript into the next prompt.
    pub assistant_text: String,
    pub code_blocks: Vec<CodeBlockExecution>,
    pub final_answer: Option<String>,
    pub compacted: bool,
}

impl Iteration {
    pub fn new(index: u32, prompt_fingerprint: impl Into<String>) -> Self {
        Self {
            index,
            prompt_fingerprint: prompt_fingerprint.into(),
            assistant_text: String::new(),
            code_blocks: Vec::new(),
            final_answer: None,
            compacted: false,
        }
    }

    pub fn sub_call_usage(&self) -> HashMap<String, Usage> {
        let mut total: HashMap<String, Usage> = HashMap::new();
        for block in &self.code_blocks {
            for (model, usage) in &block.result.sub_call_usage {
                total.entry(model.clone()).or_default().add(usage);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lmresponse_single_round_trips() {
        let resp = LMResponse::single(ChatCompletion::new("hi", Usage::new(1, 2), "m"));
        let wire = serde_json::to_string(&resp).unwrap();
        let back: LMResponse = serde_json::from_str(&wire).unwrap();
        assert_eq!(resp, back);
    }

    #[test]
    fn lmresponse_empty_batch_is_not_error() {
        let resp = LMResponse::batched(vec![]);
        assert!(!resp.is_error());
        let wire = serde_json::to_string(&resp).unwrap();
        let back: LMResponse = serde_json::from_str(&wire).unwrap();
        match back {
            LMResponse::Batched { chat_completions } => assert!(chat_completions.is_empty()),
            other => panic!("expected batched variant, got {other:?}"),
        }
    }

    #[test]
    fn lmresponse_error_round_trips() {
        let resp = LMResponse::error("backend unavailable");
        let wire = serde_json::to_string(&resp).unwrap();
        let back: LMResponse = serde_json::from_str(&wire).unwrap();
        assert_eq!(resp, back);
        assert!(back.is_error());
    }

    #[test]
    fn lmrequest_batch_round_trips() {
        let req = LMRequest::batched(vec!["a".to_string(), "b".to_string()], "scope-1", 1);
        let wire = serde_json::to_string(&req).unwrap();
        let back: LMRequest = serde_json::from_str(&wire).unwrap();
        assert_eq!(req, back);
        assert!(back.is_batched);
        assert_eq!(back.prompt.as_batch().unwrap().len(), 2);
    }

    #[test]
    fn replresult_merge_aggregates_usage() {
        let mut acc = ReplResult::ok("first");
        acc.record_sub_call("gpt", Usage::new(10, 5));
        let mut other = ReplResult::ok("second");
        other.record_sub_call("gpt", Usage::new(1, 1));
        acc.merge(&other);
        assert_eq!(acc.sub_call_usage["gpt"].total(), 17);
    }

    #[test]
    fn iteration_aggregates_sub_call_usage_across_blocks() {
        let mut it = Iteration::new(0, "fp");
        let mut r1 = ReplResult::ok("");
        r1.record_sub_call("m", Usage::new(1, 1));
        let mut r2 = ReplResult::ok("");
        r2.record_sub_call("m", Usage::new(2, 2));
        it.code_blocks.push(CodeBlockExecution {
            code: "a".into(),
            result: r1,
        });
        it.code_blocks.push(CodeBlockExecution {
            code: "b".into(),
            result: r2,
        });
        assert_eq!(it.sub_call_usage()["m"].total(), 6);
    }
}
