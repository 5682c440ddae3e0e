//! Configuration file support for the `rlm` binary.
//!
//! All runtime data lives under an `.rlm/` directory:
//! - `.rlm/config.toml` - configuration file
//! - `.rlm/sessions/<id>/` - per-run session directory (logs, trace, metadata)
//!
//! Discovery searches for `.rlm/config.toml` starting from the current
//! directory and walking up to parent directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use rlm_core::engine::{BudgetConfig, EngineConfig};
use rlm_core::router::RouterConfig;
use rlm_gateway::HttpServerConfig;

/// The runtime data directory name.
pub const RLM_DIR: &str = ".rlm";
/// The config file name within the runtime directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub budget: BudgetSection,
    pub router: RouterSection,
    pub engine: EngineSection,
    pub gateway: GatewaySection,
    pub broker: BrokerSection,
    pub trace: TraceSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root directory the gateway's filesystem tools are allowed to see.
    pub root: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self { root: PathBuf::from(".") }
    }
}

/// Turn-level budget ceilings (§5), mapped onto `rlm_core::engine::BudgetConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BudgetSection {
    pub max_iterations: u32,
    pub max_duration_secs: u64,
    pub max_code_blocks: u32,
    pub max_depth: u32,
}

impl Default for BudgetSection {
    fn default() -> Self {
        let defaults = BudgetConfig::default();
        Self {
            max_iterations: defaults.max_iterations.unwrap_or(25),
            max_duration_secs: defaults.max_duration_secs.unwrap_or(600),
            max_code_blocks: defaults.max_code_blocks.unwrap_or(200),
            max_depth: defaults.max_depth.unwrap_or(1),
        }
    }
}

impl BudgetSection {
    pub fn to_budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            max_iterations: Some(self.max_iterations),
            max_duration_secs: Some(self.max_duration_secs),
            max_code_blocks: Some(self.max_code_blocks),
            max_depth: Some(self.max_depth),
        }
    }
}

/// Sub-call router tuning (§4.E), mapped onto `rlm_core::router::RouterConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterSection {
    pub default_backend: String,
    pub max_root_tokens: u64,
    pub max_sub_tokens: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        let defaults = RouterConfig::default();
        Self {
            default_backend: defaults.default_backend,
            max_root_tokens: defaults.max_root_tokens,
            max_sub_tokens: defaults.max_sub_tokens,
            retry_attempts: defaults.retry_attempts,
            retry_backoff_ms: defaults.retry_backoff.as_millis() as u64,
        }
    }
}

impl RouterSection {
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            default_backend: self.default_backend.clone(),
            max_root_tokens: self.max_root_tokens,
            max_sub_tokens: self.max_sub_tokens,
            retry_attempts: self.retry_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Recursion-engine tuning (§4.F), mapped onto `rlm_core::engine::EngineConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSection {
    pub compaction_token_threshold: u64,
    pub compaction_keep_last_n: usize,
    pub repl_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_consecutive_backend_errors: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            compaction_token_threshold: defaults.compaction_token_threshold,
            compaction_keep_last_n: defaults.compaction_keep_last_n,
            repl_timeout_secs: defaults.repl_timeout.as_secs(),
            retry_attempts: defaults.retry_attempts,
            retry_backoff_ms: defaults.retry_backoff.as_millis() as u64,
            max_consecutive_backend_errors: defaults.max_consecutive_backend_errors,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self, budget: BudgetConfig) -> EngineConfig {
        EngineConfig {
            budget,
            compaction_token_threshold: self.compaction_token_threshold,
            compaction_keep_last_n: self.compaction_keep_last_n,
            repl_timeout: Duration::from_secs(self.repl_timeout_secs),
            retry_attempts: self.retry_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_consecutive_backend_errors: self.max_consecutive_backend_errors,
        }
    }
}

/// Retrieval-gateway HTTP transport settings (§4.G "Transport").
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySection {
    pub bind_addr: String,
    pub bearer_token: Option<String>,
    pub enable_cors: bool,
    pub enable_tracing: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let defaults = HttpServerConfig::default();
        Self {
            bind_addr: defaults.bind_addr.to_string(),
            bearer_token: defaults.bearer_token,
            enable_cors: defaults.enable_cors,
            enable_tracing: defaults.enable_tracing,
        }
    }
}

impl GatewaySection {
    pub fn to_http_server_config(&self) -> Result<HttpServerConfig> {
        let bind_addr = self
            .bind_addr
            .parse()
            .with_context(|| format!("invalid gateway.bind_addr: {}", self.bind_addr))?;
        Ok(HttpServerConfig {
            bind_addr,
            enable_cors: self.enable_cors,
            enable_tracing: self.enable_tracing,
            bearer_token: self.bearer_token.clone(),
            issuer: format!("http://{bind_addr}"),
        })
    }
}

/// Isolated-env broker settings (§4.D).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerSection {
    pub bind_addr: String,
    pub enqueue_timeout_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:8090".to_string(), enqueue_timeout_secs: 120 }
    }
}

impl BrokerSection {
    pub fn to_broker_config(&self) -> Result<rlm_core::broker::BrokerConfig> {
        let bind_addr = self
            .bind_addr
            .parse()
            .with_context(|| format!("invalid broker.bind_addr: {}", self.bind_addr))?;
        Ok(rlm_core::broker::BrokerConfig::new(bind_addr)
            .with_enqueue_timeout(Duration::from_secs(self.enqueue_timeout_secs)))
    }
}

/// Structured per-turn/per-iteration JSONL trace capture, independent of log lines.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TraceSection {
    pub enabled: bool,
}

impl Default for TraceSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Search for `.rlm/config.toml` starting from the current directory.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();
        loop {
            let rlm_dir = dir.join(RLM_DIR);
            let config_path = rlm_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, rlm_dir)));
            }
            if !dir.pop() {
                break;
            }
        }
        Ok(None)
    }

    /// Get the `.rlm` directory for a given base path.
    #[allow(dead_code)]
    pub fn rlm_dir(base: &Path) -> PathBuf {
        base.join(RLM_DIR)
    }

    pub fn config_path(rlm_dir: &Path) -> PathBuf {
        rlm_dir.join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_core_defaults() {
        let config = Config::default();
        assert_eq!(config.budget.max_depth, 1);
        assert_eq!(config.budget.max_iterations, 25);
        assert_eq!(config.router.max_root_tokens, u64::MAX);
        assert_eq!(config.engine.compaction_token_threshold, 60_000);
    }

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
[project]
root = "/home/user/myproject"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.project.root, PathBuf::from("/home/user/myproject"));
        // Defaults still apply elsewhere.
        assert_eq!(config.budget.max_depth, 1);
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
[project]
root = "."

[budget]
max_iterations = 10
max_duration_secs = 120
max_code_blocks = 50
max_depth = 2

[router]
default_backend = "mock"
max_root_tokens = 50000
max_sub_tokens = 20000
retry_attempts = 2
retry_backoff_ms = 100

[gateway]
bind_addr = "127.0.0.1:9000"
enable_cors = false

[broker]
bind_addr = "127.0.0.1:9090"
enqueue_timeout_secs = 30
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.budget.max_iterations, 10);
        assert_eq!(config.router.default_backend, "mock");
        assert_eq!(config.gateway.bind_addr, "127.0.0.1:9000");
        assert!(!config.gateway.enable_cors);
        assert_eq!(config.broker.enqueue_timeout_secs, 30);
    }

    #[test]
    fn budget_section_round_trips_into_core_budget_config() {
        let section = BudgetSection { max_iterations: 7, max_duration_secs: 42, max_code_blocks: 3, max_depth: 1 };
        let budget = section.to_budget_config();
        assert_eq!(budget.max_iterations, Some(7));
        assert_eq!(budget.max_duration_secs, Some(42));
    }

    #[test]
    fn gateway_section_rejects_invalid_bind_addr() {
        let section = GatewaySection { bind_addr: "not-an-addr".to_string(), ..GatewaySection::default() };
        assert!(section.to_http_server_config().is_err());
    }
}
