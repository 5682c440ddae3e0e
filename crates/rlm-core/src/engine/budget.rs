//! Turn-level budget tracking (§5): iteration count, wall-clock duration,
//! code-block count, and recursion depth. Token ceilings are enforced by
//! the sub-call router (§4.E), not here — the engine only reports the
//! tokens it has observed for tracing and for the compaction trigger.

use std::time::{Duration, Instant};

use crate::error::{BudgetExceededError, BudgetType, Result, RlmError};

/// Turn-level budget configuration.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub max_iterations: Option<u32>,
    pub max_duration_secs: Option<u64>,
    pub max_code_blocks: Option<u32>,
    pub max_depth: Option<u32>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_iterations: Some(25),
            max_duration_secs: Some(600),
            max_code_blocks: Some(200),
            max_depth: Some(1),
        }
    }
}

/// Tracks a turn's resource usage against its configured budget.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
    started_at: Instant,
    tokens_used: u64,
    code_blocks_executed: u32,
    current_iteration: u32,
    depth: u32,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig, depth: u32) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            tokens_used: 0,
            code_blocks_executed: 0,
            current_iteration: 0,
            depth,
        }
    }

    pub fn check_budget(&self) -> Result<()> {
        if let Some(max_iterations) = self.config.max_iterations {
            if self.current_iteration >= max_iterations {
                return Err(RlmError::BudgetExceeded(BudgetExceededError {
                    budget_type: BudgetType::Iterations,
                    limit: max_iterations as u64,
                    actual: self.current_iteration as u64,
                }));
            }
        }

        if let Some(max_secs) = self.config.max_duration_secs {
            let elapsed = self.started_at.elapsed().as_secs();
            if elapsed >= max_secs {
                return Err(RlmError::BudgetExceeded(BudgetExceededError {
                    budget_type: BudgetType::Duration,
                    limit: max_secs,
                    actual: elapsed,
                }));
            }
        }

        if let Some(max_blocks) = self.config.max_code_blocks {
            if self.code_blocks_executed >= max_blocks {
                return Err(RlmError::BudgetExceeded(BudgetExceededError {
                    budget_type: BudgetType::ToolCalls,
                    limit: max_blocks as u64,
                    actual: self.code_blocks_executed as u64,
                }));
            }
        }

        if let Some(max_depth) = self.config.max_depth {
            if self.depth >= max_depth {
                return Err(RlmError::BudgetExceeded(BudgetExceededError {
                    budget_type: BudgetType::Depth,
                    limit: max_depth as u64,
                    actual: self.depth as u64,
                }));
            }
        }

        Ok(())
    }

    pub fn record_tokens(&mut self, tokens: u64) {
        self.tokens_used += tokens;
    }

    pub fn record_code_blocks(&mut self, count: u32) {
        self.code_blocks_executed += count;
    }

    pub fn increment_iteration(&mut self) {
        self.current_iteration += 1;
    }

    pub fn iteration(&self) -> u32 {
        self.current_iteration
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn code_blocks_executed(&self) -> u32 {
        self.code_blocks_executed
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// True once the next iteration is the last one the iteration budget
    /// permits (§4.F "inject a final-turn warning").
    pub fn is_last_turn(&self) -> bool {
        self.config
            .max_iterations
            .is_some_and(|max| self.current_iteration == max.saturating_sub(1))
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn summary(&self) -> BudgetSummary {
        BudgetSummary {
            tokens_used: self.tokens_used,
            iterations_run: self.current_iteration,
            iteration_limit: self.config.max_iterations,
            code_blocks_executed: self.code_blocks_executed,
            code_block_limit: self.config.max_code_blocks,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            duration_limit_secs: self.config.max_duration_secs,
        }
    }
}

/// Summary of a turn's budget usage, surfaced to callers once it ends.
#[derive(Debug, Clone)]
pub struct BudgetSummary {
    pub tokens_used: u64,
    pub iterations_run: u32,
    pub iteration_limit: Option<u32>,
    pub code_blocks_executed: u32,
    pub code_block_limit: Option<u32>,
    pub duration_ms: u64,
    pub duration_limit_secs: Option<u64>,
}
