//! Bounded cleanup after the streaming phase.
//!
//! Each sweep re-queries a small batch of still-unassigned targets, reads a
//! fresh candidate scan from the start of the pool (the filter skips what is
//! already used), and runs one assignment pass.

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AllocatorConfig;
use crate::cursor::SourceCursor;
use crate::engine::{assign_pairs, CategoryRun};
use crate::store::AllocationStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualReport {
    pub sweeps: u32,
    pub updated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidualSweeper {
    /// Targets fetched per sweep.
    pub limit: usize,
    pub max_sweeps: u32,
    pub source_page_size: usize,
}

impl ResidualSweeper {
    pub fn new(limit: usize, max_sweeps: u32, source_page_size: usize) -> Self {
        Self {
            limit: limit.max(1),
            max_sweeps,
            source_page_size: source_page_size.max(1),
        }
    }

    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self::new(
            config.residual.limit,
            config.residual.rounds,
            config.batch.source_page_size,
        )
    }

    /// Sweep until nothing is left, a sweep assigns nothing, or the sweep budget is spent.
    pub fn run<R: Rng + ?Sized>(
        &self,
        store: &mut dyn AllocationStore,
        run: &mut CategoryRun,
        rng: &mut R,
    ) -> Result<ResidualReport> {
        let mut report = ResidualReport::default();

        while report.sweeps < self.max_sweeps {
            let mut targets = store
                .fetch_unassigned(&run.category, self.limit)
                .with_context(|| format!("residual target query for {}", run.category))?;
            if targets.is_empty() {
                break;
            }
            report.sweeps += 1;

            let mut source = SourceCursor::new(run.category.clone(), self.source_page_size);
            let mut buffer = Vec::with_capacity(targets.len() * 2);
            let fill = source
                .fill_buffer(store, &run.filter, &mut buffer, targets.len() * 2)
                .with_context(|| format!("residual candidate scan for {}", run.category))?;
            run.progress.add_skipped(fill.skipped_filter, fill.skipped_window);

            let result = assign_pairs(
                store,
                &run.category,
                &mut run.filter,
                &mut targets,
                &mut buffer,
                rng,
            )
            .with_context(|| format!("residual sweep {} for {}", report.sweeps, run.category))?;

            report.updated += result.updated;
            run.residual_updates += result.updated;
            run.progress.add_updated(result.updated);
            run.progress.log_commit(
                u64::from(report.sweeps),
                "residual",
                targets.len(),
                result.buffer_len,
                result.updated,
            );

            if result.updated == 0 {
                break;
            }
        }

        if report.updated > 0 {
            run.checkpoint("residual");
        }
        info!(
            category = %run.category,
            sweeps = report.sweeps,
            updated = report.updated,
            "residual cleanup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::checkpoint_path;
    use crate::filter::MembershipFilter;
    use crate::model::{Category, TargetKey};
    use crate::progress::ProgressRecorder;
    use crate::store::MemoryStore;
    use crate::test_support::memory_fixture;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;
    use tempfile::tempdir;

    fn run_for(dir: &std::path::Path, cat: &Category) -> CategoryRun {
        CategoryRun::new(
            cat.clone(),
            MembershipFilter::create(1_000, 12, 7).unwrap(),
            checkpoint_path(dir, cat),
            ProgressRecorder::new(cat.clone(), Duration::from_secs(30), None),
        )
    }

    #[test]
    fn sweeps_in_small_batches_until_done() {
        let dir = tempdir().unwrap();
        let cat = Category::from("B");
        let candidates: Vec<String> = (0..30).map(|i| format!("r{i}")).collect();
        let mut store = memory_fixture(&cat, &[], 7, candidates);
        let mut run = run_for(dir.path(), &cat);
        let mut rng = StdRng::seed_from_u64(2);

        let report = ResidualSweeper::new(3, 10, 4)
            .run(&mut store, &mut run, &mut rng)
            .unwrap();
        assert_eq!(report.updated, 7);
        assert_eq!(report.sweeps, 3);
        assert_eq!(run.residual_updates, 7);
        assert_eq!(store.count_unassigned(&cat).unwrap(), 0);
        assert!(store.duplicate_assignments(&cat).unwrap().is_empty());
        assert!(run.checkpoint_path.exists());
    }

    #[test]
    fn fresh_scan_skips_identifiers_already_used() {
        let dir = tempdir().unwrap();
        let cat = Category::from("B");
        let mut store = MemoryStore::new();
        store.add_target(TargetKey(1), &cat, Some("used"));
        store.add_target(TargetKey(2), &cat, None);
        store.add_candidates(&cat, ["used", "fresh"]);
        let mut run = run_for(dir.path(), &cat);
        run.filter.insert("used");
        let mut rng = StdRng::seed_from_u64(4);

        let report = ResidualSweeper::new(10, 5, 10)
            .run(&mut store, &mut run, &mut rng)
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(store.identifier_of(TargetKey(2)), Some("fresh"));
        assert_eq!(run.progress.skipped_filter_total(), 1);
    }

    #[test]
    fn stops_when_a_sweep_assigns_nothing() {
        let dir = tempdir().unwrap();
        let cat = Category::from("C");
        let mut store = memory_fixture(&cat, &[], 4, Vec::new());
        let mut run = run_for(dir.path(), &cat);
        let mut rng = StdRng::seed_from_u64(4);

        let report = ResidualSweeper::new(2, 50, 10)
            .run(&mut store, &mut run, &mut rng)
            .unwrap();
        assert_eq!(report, ResidualReport { sweeps: 1, updated: 0 });
        assert_eq!(store.count_unassigned(&cat).unwrap(), 4);
        assert!(!run.checkpoint_path.exists());
    }

    #[test]
    fn respects_sweep_budget() {
        let dir = tempdir().unwrap();
        let cat = Category::from("C");
        let candidates: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
        let mut store = memory_fixture(&cat, &[], 10, candidates);
        let mut run = run_for(dir.path(), &cat);
        let mut rng = StdRng::seed_from_u64(8);

        let report = ResidualSweeper::new(2, 2, 10)
            .run(&mut store, &mut run, &mut rng)
            .unwrap();
        assert_eq!(report.sweeps, 2);
        assert_eq!(report.updated, 4);
        assert_eq!(store.count_unassigned(&cat).unwrap(), 6);
    }
}
