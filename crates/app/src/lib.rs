use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use ari_web_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use ari_web_core::job::{open_job_store, JobController, JobRegistry, RunnerSettings};
use ari_web_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use ari_web_core::server::{app_router, app_state_with_config};

#[derive(Parser)]
#[command(
    name = "ari-web",
    about = "Web front-end that runs Azure Resource Inventory jobs",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stored status of one job as JSON
    Status {
        #[arg(help = "Job id returned when the job was started")]
        id: String,
    },
    /// Print every stored job as JSON
    Jobs,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Some(Commands::Status { id }) => print_job_status(&resolved_data_dir, &id),
        Some(Commands::Jobs) => print_jobs(&resolved_data_dir),
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_env_filter =
        parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_env_filter =
                parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Read-only controller over the store. Nothing is restored eagerly, so a
/// server running in parallel keeps ownership of its running jobs.
fn offline_controller(data_dir: &Path) -> Result<JobController> {
    let config = load_config(data_dir);
    let store = open_job_store(&config, data_dir)?;
    Ok(JobController::new(
        Arc::new(JobRegistry::new(store)),
        RunnerSettings::default(),
    ))
}

fn print_job_status(data_dir: &Path, id: &str) -> Result<()> {
    let view = offline_controller(data_dir)?.status(id);
    let encoded = serde_json::to_string_pretty(&view).context("failed to encode job status")?;
    println!("{encoded}");
    Ok(())
}

fn print_jobs(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let store = open_job_store(&config, data_dir)?;
    let views: Vec<_> = store.load_all()?.iter().map(|job| job.view()).collect();
    let encoded = serde_json::to_string_pretty(&views).context("failed to encode job list")?;
    println!("{encoded}");
    Ok(())
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, config_path(&data_dir), data_dir)?;
    let controller = state.controller().clone();
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting ari-web server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let failures = controller.flush();
    if failures > 0 {
        warn!(failures, "Some jobs could not be flushed to storage on shutdown");
    }
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => warn!(error = %err, "Failed to listen for Ctrl+C; server runs until killed"),
    }
}
