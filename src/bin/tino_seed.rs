//! Build a synthetic SQLite database for trying out the allocator.
//!
//! Each category gets `--targets` target rows, the first `--assigned` of
//! which already carry an identifier, and a pool of `--candidates` unique
//! identifiers (ITINs for `B`, SSNs otherwise).

use std::path::PathBuf;

use clap::Parser;
use tino_allocator::model::Category;
use tino_allocator::test_support::{populate_sqlite, FixtureShape};
use tino_allocator::tin::TinKind;
use tino_allocator::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Create a synthetic allocation database
#[derive(Parser, Debug)]
#[command(name = "tino_seed")]
struct Args {
    /// SQLite database file to create or extend
    #[arg(long, default_value = "tino.db")]
    database: PathBuf,

    /// Target rows per category
    #[arg(long, default_value_t = 10_000)]
    targets: usize,

    /// Candidate identifiers per category
    #[arg(long, default_value_t = 15_000)]
    candidates: usize,

    /// Targets that already have an identifier
    #[arg(long, default_value_t = 1_000)]
    assigned: usize,

    /// Categories to populate
    #[arg(long = "category", default_values_t = vec!["B".to_string(), "C".to_string()])]
    categories: Vec<String>,

    /// RNG seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn kind_for(category: &Category) -> TinKind {
    if category.as_str() == "B" {
        TinKind::Itin
    } else {
        TinKind::Ssn
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut store = SqliteStore::open(&args.database)?;
    store.init_schema()?;

    let shape = FixtureShape {
        targets: args.targets,
        assigned: args.assigned,
        candidates: args.candidates,
    };
    let mut next_key: i64 = store
        .connection()
        .query_row("SELECT COALESCE(MAX(seqno), 0) + 1 FROM table_a", [], |row| row.get(0))?;

    for (offset, name) in args.categories.iter().enumerate() {
        let category = Category::new(name.as_str());
        let kind = kind_for(&category);
        let first = next_key;
        next_key = populate_sqlite(
            &mut store,
            &category,
            kind,
            shape,
            first,
            args.seed.wrapping_add(offset as u64),
        )?;
        info!(
            category = %category,
            kind = %kind,
            first_key = first,
            targets = shape.targets,
            assigned = shape.assigned.min(shape.targets),
            candidates = shape.candidates,
            "category populated"
        );
    }

    info!(database = %args.database.display(), "seed database ready");
    Ok(())
}
