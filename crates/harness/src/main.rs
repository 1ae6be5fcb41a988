//! harness - run external analysis tools for job steps
//!
//! Main entry point for the harness binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use harness::checkpoint::{CheckpointStore, MIN_SAVE_INTERVAL};
use harness::context::{parse_sub_job, JobContext};
use harness::{integrations, Harness};
use harness_core::report::collect_by_suffix;
use harness_core::{concatenate_results, Config, JobKey};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Run external analysis tools with progress monitoring and checkpoints.
#[derive(Parser)]
#[command(name = "harness", about = "External tool execution harness", version)]
struct Cli {
    /// Config file (key=value lines)
    #[arg(long, global = true, env = "HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Config override, repeatable (e.g. --override tool_timeout_sec=3600)
    #[arg(long = "override", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a tool for one job step
    Run {
        /// Tool name: icr2ls, formularity or ascore
        tool: String,

        /// Job number
        #[arg(long)]
        job: u32,

        /// Dataset name (the data package name for --sub-job runs)
        #[arg(long)]
        dataset: String,

        /// Step number
        #[arg(long, default_value = "1")]
        step: u32,

        /// Parameter file name
        #[arg(long)]
        param_file: Option<String>,

        /// Directory holding the parameter file (default: source_dir)
        #[arg(long)]
        param_dir: Option<PathBuf>,

        /// Tool parameter, repeatable (e.g. --set search_type=sequest)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Data-package sub-job, repeatable
        #[arg(long = "sub-job", value_name = "JOB[:DATASET]")]
        sub_jobs: Vec<String>,
    },

    /// Concatenate per-job result tables into one
    Concat {
        /// Directory holding the per-job tables
        #[arg(long)]
        dir: PathBuf,

        /// File name suffix of the tables (e.g. _ascore.txt)
        #[arg(long)]
        suffix: String,

        /// Combined table to write
        #[arg(long)]
        output: PathBuf,
    },

    /// Print where a partial result file would resume
    ResumePoint {
        /// Tool that wrote the file
        tool: String,

        /// Partial result file
        #[arg(long)]
        file: PathBuf,
    },

    /// Delete checkpoints marked safe to delete
    Purge,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(async {
        match run(cli).await {
            Ok(code) => code,
            Err(e) => {
                error!("{e:#}");
                2
            }
        }
    });
    std::process::exit(code);
}

async fn run(cli: Cli) -> eyre::Result<i32> {
    let config = load_config(cli.config.as_deref(), &cli.overrides)?;

    match cli.command {
        Command::Run {
            tool,
            job,
            dataset,
            step,
            param_file,
            param_dir,
            params,
            sub_jobs,
        } => {
            let mut ctx = JobContext::from_config(JobKey::new(&dataset, job, step), &config);
            if let Some(name) = param_file {
                ctx = ctx.with_param_file(name);
            }
            if let Some(dir) = param_dir {
                ctx = ctx.with_param_source_dir(dir);
            }
            for pair in &params {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| eyre!("invalid --set value {pair}, expected KEY=VALUE"))?;
                ctx = ctx.with_param(key.trim(), value.trim());
            }
            let subs = sub_jobs
                .iter()
                .map(|spec| {
                    parse_sub_job(spec, &dataset)
                        .ok_or_else(|| eyre!("invalid --sub-job value {spec}, expected JOB[:DATASET]"))
                })
                .collect::<eyre::Result<Vec<_>>>()?;
            let ctx = ctx.with_sub_jobs(subs);

            let harness = Harness::new(config);
            spawn_signal_handler(harness.cancel_token());
            let outcome = harness.run_tool(&tool, &ctx).await?;

            let closeout = outcome.closeout();
            println!("{}", serde_json::to_string_pretty(closeout)?);
            Ok(i32::from(closeout.is_failure()))
        }

        Command::Concat {
            dir,
            suffix,
            output,
        } => {
            let inputs = collect_by_suffix(&dir, &suffix)?;
            let summary = concatenate_results(&inputs, &output)
                .wrap_err_with(|| format!("failed to write {}", output.display()))?;
            println!(
                "wrote {} rows from {} files to {}",
                summary.rows,
                summary.files,
                output.display()
            );
            Ok(0)
        }

        Command::ResumePoint { tool, file } => {
            let integration = integrations::from_name(&tool, &config)?;
            let scanner = integration
                .resume_scanner()
                .ok_or_else(|| eyre!("{} does not support resuming", integration.name()))?;
            let content = std::fs::read(&file)
                .wrap_err_with(|| format!("failed to read {}", file.display()))?;
            match scanner.scan(&String::from_utf8_lossy(&content)) {
                Some(point) => println!("{}", serde_json::to_string_pretty(&point)?),
                None => println!("no completed unit in {}", file.display()),
            }
            Ok(0)
        }

        Command::Purge => {
            let store = CheckpointStore::new(&config.transfer_dir, MIN_SAVE_INTERVAL);
            let removed = store.purge_marked()?;
            info!(removed, "purged checkpoints");
            println!("removed {removed} checkpoint files");
            Ok(0)
        }
    }
}

/// Defaults, then the config file, then `--override` pairs; relative
/// directories resolve against the current directory.
fn load_config(path: Option<&Path>, overrides: &[String]) -> eyre::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    for pair in overrides {
        config
            .apply_override(pair)
            .wrap_err_with(|| format!("invalid override {pair}"))?;
    }
    let cwd = std::env::current_dir().wrap_err("failed to read the current directory")?;
    config.resolve_paths(&cwd);
    Ok(config)
}

/// Cancel the run on SIGINT or SIGTERM; the tool is killed and the run fails.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, cancelling run"),
                _ = sigterm.recv() => info!("received SIGTERM, cancelling run"),
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, cancelling run");
            }
        }

        cancel.cancel();
    });
}
