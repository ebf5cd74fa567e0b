//! CLI command definitions for repolens.
//!
//! The API, the sweeper and the two worker pools can run as separate
//! processes sharing one Redis broker, or together in one process.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::analysis::AnalysisHandler;
use crate::api::{self, AppState};
use crate::config::AppConfig;
use crate::fetch::{FetchHandler, GitHubFetcher};
use crate::metrics::init_metrics;
use crate::scheduler::{Coordinator, JobHandler, JobKind, Sweeper, WorkerPool};

/// Repository fetch and AI review service.
#[derive(Parser)]
#[command(name = "repolens")]
#[command(about = "Fetch GitHub repositories and review them with an LLM through a job queue")]
#[command(version)]
#[command(
    long_about = "repolens accepts fetch and analyze jobs over HTTP, runs them on worker pools backed by Redis, and caches artifacts and results by content.\n\nExample usage:\n  repolens run --memory\n  repolens serve --bind 0.0.0.0:8080\n  repolens worker --pool analyze"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and run the sweeper.
    Serve(ServeArgs),

    /// Run one worker pool against the shared broker.
    Worker(WorkerArgs),

    /// Run the API, the sweeper and both worker pools in one process.
    Run(RunArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: AppConfig,
}

/// Worker pool selector.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolArg {
    Fetch,
    Analyze,
}

impl From<PoolArg> for JobKind {
    fn from(pool: PoolArg) -> Self {
        match pool {
            PoolArg::Fetch => JobKind::Fetch,
            PoolArg::Analyze => JobKind::Analyze,
        }
    }
}

/// Arguments for the worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Which queue to consume.
    #[arg(long, value_enum)]
    pub pool: PoolArg,

    #[command(flatten)]
    pub config: AppConfig,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Keep all state in process instead of Redis.
    #[arg(long)]
    pub memory: bool,

    #[command(flatten)]
    pub config: AppConfig,
}

/// Parse CLI arguments without executing commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Run(args) => run_all_command(args).await,
    }
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.config;
    let coordinator = prepare(&config, false).await?;

    let mut sweeper = Sweeper::new(coordinator.clone(), config.sweep_interval());
    sweeper.start()?;

    api::serve(config.bind, AppState::new(coordinator), shutdown_signal())
        .await
        .context("API server failed")?;

    sweeper.shutdown().await?;
    info!("Server stopped");
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let config = args.config;
    let kind = JobKind::from(args.pool);
    let coordinator = prepare(&config, false).await?;

    let mut pool = start_pool(kind, &config, &coordinator).await?;
    shutdown_signal().await;
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        kind = %kind,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        cancelled = stats.jobs_cancelled,
        "Worker pool stopped"
    );
    Ok(())
}

async fn run_all_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.config;
    let coordinator = prepare(&config, args.memory).await?;

    let mut pools = Vec::new();
    for kind in JobKind::ALL {
        if config.pool_config(kind).num_workers == 0 {
            warn!(kind = %kind, "No workers configured, jobs of this kind will wait");
            continue;
        }
        pools.push(start_pool(kind, &config, &coordinator).await?);
    }

    let mut sweeper = Sweeper::new(coordinator.clone(), config.sweep_interval());
    sweeper.start()?;

    let served = api::serve(config.bind, AppState::new(coordinator), shutdown_signal()).await;

    for pool in &mut pools {
        if let Err(e) = pool.shutdown().await {
            warn!(kind = %pool.kind(), error = %e, "Worker pool did not stop cleanly");
        }
    }
    sweeper.shutdown().await?;
    served.context("API server failed")?;

    info!("All components stopped");
    Ok(())
}

/// Validates settings, registers metrics and connects the broker.
async fn prepare(config: &AppConfig, memory: bool) -> anyhow::Result<Coordinator> {
    config.validate().context("Invalid configuration")?;
    init_metrics().context("Failed to register metrics")?;

    let broker = config
        .connect_broker(memory)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", config.redis_url))?;
    if memory {
        info!("Using in-process broker");
    } else {
        info!(prefix = %config.queue_prefix, "Connected to Redis broker");
    }

    Ok(Coordinator::new(broker, config.coordinator_config()))
}

fn build_handler(kind: JobKind, config: &AppConfig) -> anyhow::Result<Arc<dyn JobHandler>> {
    let handler: Arc<dyn JobHandler> = match kind {
        JobKind::Fetch => {
            let fetcher = GitHubFetcher::new(config.fetch_config())
                .context("Failed to build GitHub client")?;
            if !fetcher.has_token() {
                warn!("GITHUB_API_TOKEN not set, unauthenticated rate limits apply");
            }
            Arc::new(FetchHandler::new(Arc::new(fetcher)))
        }
        JobKind::Analyze => {
            let client = config
                .llm_client()
                .context("LITELLM_API_BASE or OPENROUTER_API_KEY is required for analysis")?;
            info!(api_base = %client.api_base(), model = %config.model, "Reasoning service configured");
            Arc::new(AnalysisHandler::new(
                Arc::new(client),
                config.analysis_config(),
            ))
        }
    };
    Ok(handler)
}

async fn start_pool(
    kind: JobKind,
    config: &AppConfig,
    coordinator: &Coordinator,
) -> anyhow::Result<WorkerPool> {
    let handler = build_handler(kind, config)?;
    let mut pool = WorkerPool::new(config.pool_config(kind), coordinator.clone(), handler)?;
    pool.start().await?;
    Ok(pool)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
