//! `niflow` - build, validate and run neuroimaging pipelines
//!
//! ```bash
//! niflow validate pipeline.yaml
//! niflow run pipeline.yaml --max-concurrency 4 --report out/sub-01.html
//! ```
//!
//! Exit status is 0 when every node succeeded, 1 when any node failed or the
//! run was interrupted, and 2 when the pipeline could not be loaded.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use commands::RunOptions;

#[derive(Parser)]
#[command(name = "niflow")]
#[command(about = "Typed, cached pipelines for neuroimaging preprocessing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline
    Run {
        /// Pipeline document (YAML or JSON)
        config: PathBuf,

        /// Maximum number of steps running at once
        #[arg(long, short = 'j')]
        max_concurrency: Option<usize>,

        /// Cache directory, overriding the pipeline's `cache_dir`
        #[arg(long, conflicts_with = "no_cache")]
        cache_dir: Option<PathBuf>,

        /// Keep the cache in memory for this run only
        #[arg(long)]
        no_cache: bool,

        /// Report output file, overriding the pipeline's `report.output`
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Build and freeze a pipeline without running it
    Validate {
        /// Pipeline document (YAML or JSON)
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match execute(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::from(2)
        }
    }
}

async fn execute(command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Validate { config } => {
            let plan = commands::validate(&config)?;
            println!(
                "Pipeline '{}' is valid: {} steps in {} layers",
                plan.graph_id(),
                plan.len(),
                plan.layers().len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            config,
            max_concurrency,
            cache_dir,
            no_cache,
            report,
        } => {
            let options = RunOptions {
                max_concurrency,
                cache_dir,
                no_cache,
                report,
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupted, cancelling run");
                    on_signal.cancel();
                }
            });

            let report = commands::run(&config, &options, cancel).await?;
            print!("{}", report.summary());
            if report.succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
    }
}
