//! `rlm`: CLI entry point for the recursive-inference runtime.
//!
//! Wires configuration, logging, the sub-call router (§4.E), the recursion
//! engine (§4.F), the isolated-env broker (§4.D), and the retrieval gateway
//! (§4.G) together into a runnable process.

mod config;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use rlm_core::backend::MockBackend;
use rlm_core::broker::{BrokerPoller, BrokerServer};
use rlm_core::engine::{CancellationToken, RecursionEngine};
use rlm_core::router::{SubCallDispatcher, SubCallRouter};
use rlm_core::types::ChatCompletion;
use rlm_gateway::fs::{RealFileSystem, SharedFileSystem};
use rlm_gateway::path_validator::PathValidator;
use rlm_gateway::session::SessionManager;
use rlm_gateway::stdio::{run_stdio_server, StdioServerConfig};
use rlm_gateway::tools::{GatewayState, GatewayToolRegistry};
use rlm_gateway::GatewayHttpServer;

/// Recursive-inference runtime: recursion engine, sub-call router, isolated-env
/// broker, and retrieval-tool gateway.
#[derive(Parser)]
#[command(name = "rlm")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose (debug) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to an `.rlm` directory (default: search for `.rlm/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Working directory the gateway's filesystem tools are rooted at.
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new `.rlm` directory with a default config file.
    Init {
        /// Force overwrite of an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Start the retrieval-tool gateway over MCP stdio.
    GatewayStdio,

    /// Start the retrieval-tool gateway over HTTP (JSON-RPC + SSE).
    GatewayHttp {
        #[arg(long)]
        bind_addr: Option<String>,
        #[arg(long)]
        bearer_token: Option<String>,
    },

    /// Start the isolated-env broker standalone.
    Broker {
        #[arg(long)]
        bind_addr: Option<String>,
    },

    /// Run one recursive-inference turn against the mock backend and print
    /// the final answer. Intended for local smoke-testing the engine and
    /// gateway wiring; real LM backends are out of scope (§1 Non-goals) and
    /// plug in by implementing `rlm_core::backend::LLMBackend`.
    Run {
        /// Root prompt for the turn.
        prompt: String,
        /// Canned final answer the mock backend returns immediately.
        #[arg(long, default_value = "done")]
        mock_answer: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

/// Logs to a single file in the session directory (no rotation), matching
/// the teacher's per-run session-logging convention.
fn init_session_logging(session_dir: &std::path::Path, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_appender = RollingFileAppender::new(Rotation::NEVER, session_dir, "rlm.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> = std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter)
        .init();
}

/// Load config from an explicit path or by walking up from the cwd.
fn load_config(override_path: Option<&PathBuf>) -> (Config, Option<PathBuf>) {
    if let Some(path) = override_path {
        let config_file = if path.is_dir() { path.join(config::CONFIG_FILE) } else { path.clone() };
        let rlm_dir = config_file.parent().unwrap_or(path).to_path_buf();
        match Config::from_file(&config_file) {
            Ok(config) => (config, Some(rlm_dir)),
            Err(e) => {
                eprintln!("failed to load config from {}: {e}", config_file.display());
                std::process::exit(1);
            }
        }
    } else {
        match Config::find_and_load() {
            Ok(Some((config, rlm_dir))) => (config, Some(rlm_dir)),
            Ok(None) => (Config::default(), None),
            Err(e) => {
                eprintln!("error searching for config: {e}, using defaults");
                (Config::default(), None)
            }
        }
    }
}

fn resolve_work_path(cli_workdir: Option<PathBuf>, config_dir: Option<&PathBuf>, project_root: &PathBuf) -> PathBuf {
    let work_path = cli_workdir
        .unwrap_or_else(|| config_dir.map(|d| d.join(project_root)).unwrap_or_else(|| project_root.clone()));
    work_path.canonicalize().unwrap_or(work_path)
}

fn build_gateway_state(
    work_path: PathBuf,
    config: &Config,
    dispatcher: Arc<dyn SubCallDispatcher>,
) -> Arc<GatewayState> {
    let fs: SharedFileSystem = Arc::new(RealFileSystem::new());
    Arc::new(GatewayState {
        sessions: Arc::new(SessionManager::new()),
        path_validator: Arc::new(PathValidator::new(vec![work_path], fs.clone())),
        fs,
        dispatcher,
        engine_config: config.engine.to_engine_config(config.budget.to_budget_config()),
    })
}

/// Register the backends named in config. Only `mock` is implemented in
/// this workspace (§1 Non-goals: concrete LM clients are out of scope);
/// additional backends register here by implementing `LLMBackend`.
fn build_router(config: &Config) -> Result<SubCallRouter> {
    let mut router = SubCallRouter::new(config.router.to_router_config());
    if config.router.default_backend.is_empty() || config.router.default_backend == "mock" {
        router.register_backend(Arc::new(MockBackend::new(
            "mock",
            vec![ChatCompletion::new("FINAL(mock response)", rlm_core::types::Usage::new(1, 1), "mock")],
        )));
    }
    Ok(router)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_dir) = load_config(cli.config.as_ref());
    let work_path = resolve_work_path(cli.workdir.clone(), config_dir.as_ref(), &config.project.root);

    match cli.command {
        Commands::Init { force } => {
            init_logging(cli.verbose);
            run_init(force)?;
        }

        Commands::GatewayStdio => {
            let rlm_dir = config_dir.clone().unwrap_or_else(|| PathBuf::from(config::RLM_DIR));
            let session_id = session::SessionId::generate();
            let session_dir = session::session_dir(&rlm_dir, &session_id);
            std::fs::create_dir_all(&session_dir)?;
            init_session_logging(&session_dir, cli.verbose);

            let router = build_router(&config)?;
            let dispatcher: Arc<dyn SubCallDispatcher> = Arc::new(router);
            let state = build_gateway_state(work_path, &config, dispatcher);
            let registry = Arc::new(GatewayToolRegistry::new(state));

            info!("starting gateway over MCP stdio");
            run_stdio_server(registry, StdioServerConfig::default()).await?;
        }

        Commands::GatewayHttp { bind_addr, bearer_token } => {
            init_logging(cli.verbose);
            let mut http_config = config.gateway.to_http_server_config()?;
            if let Some(addr) = bind_addr {
                http_config.bind_addr = addr.parse().context("invalid --bind-addr")?;
            }
            if bearer_token.is_some() {
                http_config.bearer_token = bearer_token;
            }

            let router = build_router(&config)?;
            let dispatcher: Arc<dyn SubCallDispatcher> = Arc::new(router);
            let state = build_gateway_state(work_path, &config, dispatcher);
            let registry = Arc::new(GatewayToolRegistry::new(state));

            info!(addr = %http_config.bind_addr, "starting gateway over HTTP");
            GatewayHttpServer::new(http_config, registry).run().await?;
        }

        Commands::Broker { bind_addr } => {
            init_logging(cli.verbose);
            let mut broker_config = config.broker.to_broker_config()?;
            if let Some(addr) = bind_addr {
                broker_config.bind_addr = addr.parse().context("invalid --bind-addr")?;
            }

            let router = build_router(&config)?;
            let dispatcher: Arc<dyn SubCallDispatcher> = Arc::new(router);
            let poller = BrokerPoller::new(format!("http://{}", broker_config.bind_addr), dispatcher);

            info!(addr = %broker_config.bind_addr, "starting isolated-env broker");
            let poller_handle = tokio::spawn(async move {
                let _ = poller.run().await;
            });
            let result = BrokerServer::new(broker_config).run().await;
            poller_handle.abort();
            result?;
        }

        Commands::Run { prompt, mock_answer } => {
            init_logging(cli.verbose);
            let mut router = build_router(&config)?;
            router.register_backend(Arc::new(MockBackend::new(
                "mock",
                vec![ChatCompletion::new(
                    format!("FINAL({mock_answer})"),
                    rlm_core::types::Usage::new(1, 1),
                    "mock",
                )],
            )));
            let dispatcher: Arc<dyn SubCallDispatcher> = Arc::new(router);
            let engine =
                RecursionEngine::new(dispatcher, config.engine.to_engine_config(config.budget.to_budget_config()));

            let session_id = session::SessionId::generate();
            let result = engine
                .run_turn(session_id.to_string(), prompt, serde_json::Value::Null, &CancellationToken::new())
                .await?;

            println!("{}", result.final_answer.unwrap_or_else(|| "(no final answer)".to_string()));
            info!(
                iterations = result.iterations_run,
                tokens_used = result.tokens_used,
                termination = %result.termination_reason,
                "turn complete"
            );
        }
    }

    Ok(())
}

fn run_init(force: bool) -> Result<()> {
    let rlm_dir = PathBuf::from(config::RLM_DIR);
    let config_path = rlm_dir.join(config::CONFIG_FILE);

    if config_path.exists() && !force {
        anyhow::bail!(".rlm/config.toml already exists. Use --force to overwrite.");
    }

    if !rlm_dir.exists() {
        std::fs::create_dir_all(&rlm_dir)?;
        info!("created {}/", rlm_dir.display());
    }

    let default_config = r#"# rlm configuration
# All paths are relative to this .rlm/ directory unless absolute

[project]
root = ".."  # parent directory (the actual project root)

[budget]
max_iterations = 25
max_duration_secs = 600
max_code_blocks = 200
max_depth = 1

[router]
default_backend = "mock"
max_root_tokens = 100000
max_sub_tokens = 20000
retry_attempts = 3
retry_backoff_ms = 200

[engine]
compaction_token_threshold = 60000
compaction_keep_last_n = 3
repl_timeout_secs = 60
retry_attempts = 3
retry_backoff_ms = 200
max_consecutive_backend_errors = 3

[gateway]
bind_addr = "127.0.0.1:8091"
enable_cors = true
enable_tracing = true

[broker]
bind_addr = "127.0.0.1:8090"
enqueue_timeout_secs = 120

[trace]
enabled = true
"#;

    std::fs::write(&config_path, default_config)?;
    info!("created {}", config_path.display());
    info!("next steps:");
    info!("  1. edit .rlm/config.toml to configure your project");
    info!("  2. run 'rlm gateway-stdio' or 'rlm gateway-http' to expose the retrieval tools");
    info!("  3. run 'rlm run \"<prompt>\"' to smoke-test the recursion engine");

    Ok(())
}
