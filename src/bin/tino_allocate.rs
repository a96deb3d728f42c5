//! Allocate identifiers to every configured category.
//!
//! ```bash
//! tino_allocate --config tino.toml --database /data/tino.db --category B
//! ```
//!
//! Exits with status 1 when a category fails; the failing category's filter
//! is checkpointed first, so the run can be restarted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tino_allocator::config::{
    CheckpointOverrides, ConfigOverrides, CursorOverrides, DatabaseOverrides, ResidualOverrides,
};
use tino_allocator::{Allocator, AllocatorConfig, CursorStrategy, SqliteStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Assign unique identifiers from the candidate pool to unassigned targets
#[derive(Parser, Debug)]
#[command(name = "tino_allocate")]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "TINO_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Directory for filter checkpoints
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Category to process (repeatable); defaults to every configured category
    #[arg(long = "category")]
    categories: Vec<String>,

    /// Skip the residual cleanup sweeps
    #[arg(long)]
    no_residual: bool,

    /// Target cursor strategy: ordered or requery
    #[arg(long)]
    strategy: Option<CursorStrategy>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            database: self.database.clone().map(|path| DatabaseOverrides { path: Some(path) }),
            checkpoint: self
                .checkpoint_dir
                .clone()
                .map(|dir| CheckpointOverrides { dir: Some(dir) }),
            residual: self.no_residual.then_some(ResidualOverrides {
                enabled: Some(false),
            }),
            cursor: self.strategy.map(|strategy| CursorOverrides {
                strategy: Some(strategy),
            }),
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = AllocatorConfig::load(args.config.as_deref(), args.overrides())?;
    config.select_categories(&args.categories);
    config.validate()?;

    info!(
        database = %config.database.path.display(),
        checkpoint_dir = %config.checkpoint.dir.display(),
        target_batch = config.batch.target_batch,
        candidate_batch = config.batch.candidate_batch,
        strategy = %config.cursor.strategy,
        "starting allocation"
    );

    let store = SqliteStore::open(&config.database.path)?;
    let mut allocator = Allocator::new(store, config);
    let reports = allocator.run()?;

    for report in &reports {
        println!("{report}");
    }
    let total: u64 = reports.iter().map(|r| r.total_updates()).sum();
    info!(categories = reports.len(), total, "allocation finished");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "allocation failed");
            eprintln!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}
