//! Fixtures shared by unit tests, integration tests, and benchmarks.

use std::path::Path;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{AllocatorConfig, CategoryConfig};
use crate::model::{Assignment, Category, SourcePosition, SourceRow, TargetKey};
use crate::sqlite::SqliteStore;
use crate::store::{AllocationStore, MemoryStore};
use crate::tin::{TinGenerator, TinKind};

/// Memory store with `seeded.len()` assigned targets (keys `1..`), then
/// `unassigned` empty targets, and `candidates` in the source pool.
pub fn memory_fixture(
    category: &Category,
    seeded: &[&str],
    unassigned: usize,
    candidates: Vec<String>,
) -> MemoryStore {
    let mut store = MemoryStore::new();
    let mut key = 0i64;
    for identifier in seeded {
        key += 1;
        store.add_target(TargetKey(key), category, Some(*identifier));
    }
    for _ in 0..unassigned {
        key += 1;
        store.add_target(TargetKey(key), category, None);
    }
    store.add_candidates(category, candidates);
    store
}

/// Sizes of a synthetic category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureShape {
    pub targets: usize,
    pub assigned: usize,
    pub candidates: usize,
}

/// Populate `store` with one category: `assigned` targets already carry an
/// identifier from the pool, the rest are empty. Keys start at `first_key`.
///
/// Returns the next free key.
pub fn populate_sqlite(
    store: &mut SqliteStore,
    category: &Category,
    kind: TinKind,
    shape: FixtureShape,
    first_key: i64,
    seed: u64,
) -> Result<i64> {
    let mut tins = TinGenerator::new(StdRng::seed_from_u64(seed));
    let pool = tins.unique_batch(kind, shape.candidates, shape.candidates.saturating_mul(20).max(64))?;
    let assigned = shape.assigned.min(shape.targets).min(pool.len());

    let rows = (0..shape.targets).map(|i| {
        let key = TargetKey(first_key + i as i64);
        let identifier = (i < assigned).then(|| pool[i].clone());
        (key, identifier)
    });
    store.insert_targets(category, rows)?;
    store.insert_candidates(category, &pool)?;
    Ok(first_key + shape.targets as i64)
}

/// Small-batch configuration writing checkpoints and the ledger under `dir`.
pub fn test_config(dir: &Path, categories: &[(&str, u64)]) -> AllocatorConfig {
    let mut config = AllocatorConfig::default();
    config.database.path = dir.join("tino.db");
    config.categories = categories
        .iter()
        .map(|(name, expected)| CategoryConfig::new(*name, *expected))
        .collect();
    config.batch.target_batch = 16;
    config.batch.candidate_batch = 24;
    config.batch.target_page_size = 5;
    config.batch.source_page_size = 7;
    config.checkpoint.dir = dir.join("bloom");
    config.checkpoint.rounds = 2;
    config.residual.limit = 8;
    config.residual.rounds = 10;
    config.progress.ledger = Some(dir.join("progress.csv"));
    config.engine.shuffle_seed = Some(17);
    config
}

/// Store wrapper that fills every target of the next `races` assignment
/// batches with an outside identifier just before the batch is applied.
#[derive(Debug)]
pub struct RacingStore<S> {
    inner: S,
    races: usize,
    raced: u64,
}

impl<S: AllocationStore> RacingStore<S> {
    pub fn new(inner: S, races: usize) -> Self {
        Self {
            inner,
            races,
            raced: 0,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Targets taken by the outside writer so far.
    pub fn raced(&self) -> u64 {
        self.raced
    }
}

impl<S: AllocationStore> AllocationStore for RacingStore<S> {
    fn for_each_assigned(&mut self, category: &Category, f: &mut dyn FnMut(&str)) -> Result<u64> {
        self.inner.for_each_assigned(category, f)
    }

    fn fetch_unassigned_ordered(
        &mut self,
        category: &Category,
        after: Option<TargetKey>,
        limit: usize,
    ) -> Result<Vec<TargetKey>> {
        self.inner.fetch_unassigned_ordered(category, after, limit)
    }

    fn fetch_unassigned(&mut self, category: &Category, limit: usize) -> Result<Vec<TargetKey>> {
        self.inner.fetch_unassigned(category, limit)
    }

    fn fetch_candidates(
        &mut self,
        category: &Category,
        after: Option<SourcePosition>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        self.inner.fetch_candidates(category, after, limit)
    }

    fn apply_assignments(
        &mut self,
        category: &Category,
        assignments: &[Assignment],
    ) -> Result<Vec<bool>> {
        if self.races > 0 {
            self.races -= 1;
            let outside: Vec<Assignment> = assignments
                .iter()
                .map(|a| Assignment::new(a.target, format!("outside-{}", a.target.0)))
                .collect();
            let taken = self.inner.apply_assignments(category, &outside)?;
            self.raced += taken.iter().filter(|t| **t).count() as u64;
        }
        self.inner.apply_assignments(category, assignments)
    }

    fn count_unassigned(&mut self, category: &Category) -> Result<u64> {
        self.inner.count_unassigned(category)
    }

    fn duplicate_assignments(&mut self, category: &Category) -> Result<Vec<(String, u64)>> {
        self.inner.duplicate_assignments(category)
    }
}
