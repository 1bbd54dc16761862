mod config;

use std::{net::SocketAddr, sync::Arc};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use atc_auth::Authenticator;
use atc_executor::{Executor, KeywordPlanner, Replanner};
use atc_gateway::MethodRegistry;
use atc_nodes::NodeSessionManager;
use atc_orchestrator::TaskOrchestrator;
use atc_protocol::defaults;
use atc_ratelimit::RateLimiter;
use atc_tools::ToolRuntime;

#[derive(Parser)]
#[command(name = "atc", about = "Agent task orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true, env = "ATC_BIND")]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true, env = "ATC_PORT")]
    port: Option<u16>,
    /// Workspace root handed to every tool invocation (overrides config value).
    #[arg(long, global = true, env = "ATC_WORKSPACE_ROOT")]
    workspace_root: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default when no subcommand is provided).
    Serve,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), "atc starting");

    match cli.command {
        None | Some(Commands::Serve) => serve(cli).await,
    }
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let config = config::discover_and_load();

    let bind = cli.bind.unwrap_or(config.server.bind);
    let port = cli.port.unwrap_or(config.server.port);
    let workspace_root = cli
        .workspace_root
        .or(config.workspace_root)
        .unwrap_or(std::env::current_dir()?);

    let rate_limiter = Arc::new(RateLimiter::new());
    let authenticator = Arc::new(Authenticator::new(config.tokens).with_rate_limiter(Arc::clone(&rate_limiter)));
    if !authenticator.is_enabled() {
        info!("no tokens configured, authentication disabled (loopback-by-default posture)");
    }
    let node_sessions = Arc::new(NodeSessionManager::new());

    let tool_runtime = Arc::new(ToolRuntime::new());
    let executor = Arc::new(Executor::new(
        Arc::new(KeywordPlanner::new()),
        Arc::clone(&tool_runtime),
        Replanner::new(defaults::MAX_RETRIES_PER_STEP, defaults::MAX_ALTERNATIVES_PER_STEP),
        defaults::TASK_TIMEOUT_MS,
    ));
    let orchestrator = TaskOrchestrator::new(tool_runtime, executor, workspace_root);

    let gateway = atc_gateway::build(rate_limiter, authenticator, node_sessions, orchestrator);
    let methods = Arc::new(MethodRegistry::new());

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    atc_gateway::serve(addr, gateway, methods, shutdown_signal()).await
}

// Signal installation only fails if the OS refuses to hand out a handler at
// all, a startup-time environment fault rather than a runtime condition to
// propagate; the canonical tokio shutdown idiom expects here.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("atc: shutdown signal received");
}
