//! Command-line interface for quorum.
//!
//! Provides commands for producing observations from a job definition,
//! listing persisted runs, and showing the resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::adapters::{CommandRunExecutor, SqliteDatabase};
use crate::config;
use crate::core::{
    DataSource, ObservationSource, RunResultSaver, RunStore, Transactor, TxOptions,
};
use crate::domain::JobDefinition;

/// quorum - Transactional job runs and observations
#[derive(Parser, Debug)]
#[command(name = "quorum")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job's pipeline and print the resulting observations
    Observe {
        /// Job definition file (YAML)
        job_file: PathBuf,

        /// Number of observations to make
        #[arg(short, long, default_value = "1")]
        rounds: u32,

        /// Pause between observations in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Observe {
                job_file,
                rounds,
                interval_ms,
            } => observe(&job_file, rounds, Duration::from_millis(interval_ms)).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Open the run database and make sure its tables exist
async fn open_store(path: &Path) -> Result<Transactor<SqliteDatabase>> {
    let db = SqliteDatabase::open(path)?;
    let transactor = Transactor::new(Arc::new(db));

    transactor
        .transact(&TxOptions::default(), |tx| {
            Box::pin(async move { RunStore::migrate(tx) })
        })
        .await?;

    Ok(transactor)
}

/// Make `rounds` observations, persisting every run
async fn observe(job_file: &Path, rounds: u32, interval: Duration) -> Result<()> {
    let cfg = config::config()?;
    let definition = JobDefinition::from_file(job_file)?;

    let transactor = open_store(&cfg.database_path).await?;
    let (run_tx, run_rx) = mpsc::channel(cfg.observation.run_results_buffer);
    let saver = RunResultSaver::new(transactor)
        .with_options(cfg.tx_options.clone())
        .start(run_rx);

    let source = ObservationSource::new(
        Arc::new(CommandRunExecutor::new()),
        definition.job,
        definition.pipeline,
        run_tx,
    );

    eprintln!(
        "[Observing job {} ({})]",
        source.job().id,
        source.job().name_or_default()
    );

    let mut failures = 0;
    for round in 1..=rounds {
        match source.observe(cfg.observation.deadline()).await {
            Ok(observation) => println!("{}", observation),
            Err(e) => {
                failures += 1;
                eprintln!("[Round {} failed: {}]", round, e);
            }
        }

        if round < rounds {
            tokio::time::sleep(interval).await;
        }
    }

    // Dropping the source releases the last sender
    drop(source);
    let stats = saver.close().await?;
    eprintln!("[Saved {} runs, {} failed to save]", stats.saved, stats.failed);

    if rounds > 0 && failures == rounds {
        anyhow::bail!("All {} observations failed", rounds);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let transactor = open_store(&cfg.database_path).await?;

    let (runs, total) = transactor
        .transact(&TxOptions::read_only(), move |tx| {
            Box::pin(async move {
                let runs = RunStore::list_runs(tx, limit)?;
                let total = RunStore::count_runs(tx)?;
                Ok((runs, total))
            })
        })
        .await
        .context("Failed to list runs")?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<8} {:<10} {:<26} {}",
        "RUN ID", "JOB", "STATE", "CREATED", "OUTPUTS"
    );
    println!("{}", "-".repeat(100));

    for run in &runs {
        let outputs = run
            .outputs
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<8} {:<10} {:<26} {}",
            run.id,
            run.job_id,
            run.state.as_str(),
            run.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            outputs
        );
    }

    eprintln!("\n[Showing {} of {} runs]", runs.len(), total);

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let resolved = cfg.tx_options.resolve();

    println!("quorum configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database_path.display());
    println!();
    println!("Transactions:");
    println!("  Isolation:                     {}", resolved.isolation);
    println!("  Lock timeout:                  {:?}", resolved.lock_timeout);
    println!(
        "  Idle in transaction timeout:   {:?}",
        resolved.idle_in_tx_session_timeout
    );
    println!();
    println!("Observation:");
    println!("  Timeout:            {:?}", cfg.observation.timeout);
    println!("  Grace period:       {:?}", cfg.observation.grace_period);
    println!("  Run results buffer: {}", cfg.observation.run_results_buffer);

    Ok(())
}
