//! Command-line front end for simcon.
//!
//! Runs TOML job manifests through the controller, cleans their cached
//! results, prints fingerprints and shows the effective configuration.

use clap::{Parser, Subcommand};
use simcon::config::{Config, LogFormat};
use simcon::controller::{JobOutcome, RunOptions, RunReport};
use simcon::error::Result;
use simcon::hash::{fingerprint, HashItem};
use simcon::manifest::Manifest;
use simcon::store::ResultStore;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "simcon", version, about = "Cached simulation job controller")]
struct Cli {
    /// Configuration file applied over the user and local files
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every job of a manifest
    Run {
        /// Job manifest
        manifest: PathBuf,
        /// Ignore cached results and run everything again
        #[arg(long)]
        force: bool,
        /// Delete the job directories after the run
        #[arg(long)]
        remove_results: bool,
    },
    /// Delete the cached results of a manifest's jobs
    Clean {
        /// Job manifest
        manifest: PathBuf,
    },
    /// Print the fingerprint of files and values, in order
    Hash {
        /// Files whose contents are hashed
        #[arg(long = "file", short = 'f')]
        files: Vec<PathBuf>,
        /// Literal values
        #[arg(long = "value", short = 'v')]
        values: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

fn setup_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("simcon={},warn", config.logging.level)));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn print_report(report: &RunReport) {
    for record in report.records() {
        match &record.outcome {
            JobOutcome::Cached => println!("cached     {}", record.label),
            JobOutcome::Succeeded => println!("succeeded  {}", record.label),
            JobOutcome::Failed { reason, .. } => {
                println!("failed     {}: {reason}", record.label);
            }
            JobOutcome::TimedOut { elapsed, .. } => {
                println!("timed out  {} after {}s", record.label, elapsed.as_secs());
            }
        }
        if let Some(tail) = record.outcome.log_tail() {
            println!("  log of {}:", record.workdir.display());
            for line in tail.lines() {
                println!("  | {line}");
            }
        }
    }
    println!(
        "{} jobs: {} cached, {} succeeded, {} failed",
        report.records().len(),
        report.cached(),
        report.succeeded(),
        report.failed()
    );
}

async fn run(manifest: PathBuf, options: RunOptions, config: &Config) -> Result<bool> {
    let batch = Manifest::from_file(&manifest)?.batch()?;
    let controller = config.controller()?;
    info!(
        "Running {} jobs from {} with at most {} at a time",
        batch.len(),
        manifest.display(),
        controller.max_concurrent()
    );

    let report = controller.run(batch, options).await?;
    print_report(&report);
    Ok(report.success())
}

fn clean(manifest: PathBuf, config: &Config) -> Result<()> {
    let batch = Manifest::from_file(&manifest)?.batch()?;
    let store = ResultStore::new(config.simulation.root.clone())?;
    let mut removed = 0usize;
    for job in batch.deduplicate() {
        let key = store.key(&job);
        if store.working_dir(&key).exists() {
            store.delete(&key)?;
            removed += 1;
        }
    }
    println!("removed {removed} job directories");
    Ok(())
}

async fn dispatch(cli: Cli, config: Config) -> Result<ExitCode> {
    match cli.command {
        Command::Run {
            manifest,
            force,
            remove_results,
        } => {
            let options = RunOptions::default()
                .force(force)
                .remove_results(remove_results);
            if run(manifest, options, &config).await? {
                Ok(ExitCode::SUCCESS)
            } else {
                warn!("Some jobs failed");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Clean { manifest } => {
            clean(manifest, &config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Hash { files, values } => {
            let items = files
                .into_iter()
                .map(HashItem::File)
                .chain(values.into_iter().map(HashItem::Value));
            println!("{}", fingerprint(items));
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config);

    match dispatch(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
