//! Error taxonomy for the recursion engine, sandbox, REPL environment, and
//! sub-call router (§7).

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RlmError>;

/// Errors that can occur while driving a turn.
#[derive(Debug, Error)]
pub enum RlmError {
    /// Sandbox rejected code before execution (§4.B). Surfaced as
    /// `ReplResult.error`, never fatal to the turn.
    #[error("validator rejected code: {0}")]
    ValidatorRejection(String),

    /// Sandbox per-execution wall-clock timeout fired. Surfaced as
    /// `ReplResult.error`, never fatal to the turn.
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(std::time::Duration),

    /// Socket/HTTP disconnect or timeout talking to the router or broker.
    /// Recovered at the router/broker boundary with retry + backoff.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// The LM backend itself returned an error.
    #[error("backend error: {0}")]
    BackendFailure(String),

    /// Token/iteration/depth budget exceeded.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(BudgetExceededError),

    /// A backend-name preference hint could not be resolved to any
    /// registered backend. No fallback.
    #[error("could not resolve backend for preference: {0}")]
    ResolutionFailure(String),

    /// A data-model invariant was violated (e.g. a path validator receiving
    /// a restricted pattern). Fails fast with an explanatory message.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The turn was cancelled; the engine returns its best-so-far answer.
    #[error("cancelled")]
    Cancelled,

    /// Invalid request shape (ambient — not one of the spec's named error
    /// kinds, but needed at request-parsing boundaries).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error that does not fit another variant.
    #[error("internal error: {0}")]
    Internal(String),

    /// Protocol error (wire codec framing, broker HTTP contract, MCP, …).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RlmError::TransientTransport(_))
    }
}

/// Details about which budget was exceeded.
#[derive(Debug, Clone)]
pub struct BudgetExceededError {
    pub budget_type: BudgetType,
    pub limit: u64,
    pub actual: u64,
}

impl std::fmt::Display for BudgetExceededError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} budget exceeded: {} > {}",
            self.budget_type, self.actual, self.limit
        )
    }
}

/// Which ceiling was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetType {
    /// Total tokens across all calls at this scope (root or sub).
    RootTokens,
    SubTokens,
    /// Wall-clock time.
    Duration,
    /// Recursion depth.
    Depth,
    /// Number of tool calls.
    ToolCalls,
    /// Iteration count.
    Iterations,
}

impl From<serde_json::Error> for RlmError {
    fn from(e: serde_json::Error) -> Self {
        RlmError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for RlmError {
    fn from(e: std::io::Error) -> Self {
        RlmError::TransientTransport(e.to_string())
    }
}

impl From<pyo3::PyErr> for RlmError {
    fn from(e: pyo3::PyErr) -> Self {
        RlmError::ValidatorRejection(e.to_string())
    }
}

impl From<reqwest::Error> for RlmError {
    fn from(e: reqwest::Error) -> Self {
        RlmError::TransientTransport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_display() {
        let err = BudgetExceededError {
            budget_type: BudgetType::Depth,
            limit: 10,
            actual: 15,
        };
        assert_eq!(err.to_string(), "Depth budget exceeded: 15 > 10");
    }

    #[test]
    fn transient_transport_is_retryable() {
        assert!(RlmError::TransientTransport("reset".into()).is_retryable());
        assert!(!RlmError::Cancelled.is_retryable());
    }

    #[test]
    fn io_error_converts_to_transient_transport() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err: RlmError = io_err.into();
        assert!(matches!(err, RlmError::TransientTransport(_)));
    }
}
