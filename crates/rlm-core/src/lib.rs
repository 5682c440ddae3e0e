//! rlm-core: recursion engine, sandboxed REPL environment, sub-call router,
//! and wire codec for the recursive-inference runtime.

pub mod backend;
pub mod broker;
pub mod codec;
pub mod engine;
pub mod error;
pub mod parsing;
pub mod prompts;
pub mod repl;
pub mod router;
pub mod sandbox;
pub mod types;

pub use backend::{LLMBackend, LoggingBackend, MockBackend, SharedBackend, StreamChunk};
pub use broker::{BrokerConfig, BrokerPoller, BrokerServer};
pub use engine::{
    BudgetConfig, BudgetSummary, BudgetTracker, CancellationToken, EngineConfig, RecursionEngine,
    TurnResult, TurnState,
};
pub use error::{BudgetExceededError, BudgetType, Result, RlmError};
pub use prompts::{COMPACTION_NOTICE, CORE_RLM_BEHAVIOR, DEFAULT_EXHAUSTION_MESSAGE, LAST_TURN_WARNING};
pub use repl::ReplEnvironment;
pub use router::{MockDispatcher, RouterConfig, SubCallDispatcher, SubCallRouter};
pub use sandbox::{SandboxTier, Validator};
pub use types::{
    ChatCompletion, ChatMessage, CodeBlockExecution, Iteration, LMRequest, LMResponse,
    ModelPreferences, PromptPayload, ReplResult, Usage,
};
