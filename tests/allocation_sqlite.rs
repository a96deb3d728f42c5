mod support;

use std::fs;

use support::{assert_unique, assigned_identifiers, sqlite_fixture};
use tempfile::tempdir;
use tino_allocator::test_support::{memory_fixture, test_config, FixtureShape, RacingStore};
use tino_allocator::tin::{classify, TinKind};
use tino_allocator::{
    checkpoint_path, AllocationStore, Allocator, Category, CursorStrategy, MembershipFilter,
    ResidualReport, StreamOutcome,
};

const SHAPE: FixtureShape = FixtureShape {
    targets: 100,
    assigned: 10,
    candidates: 150,
};

fn run_to_completion(strategy: CursorStrategy) -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path(), &[("B", 1_000), ("C", 1_000)]);
    config.cursor.strategy = strategy;
    let store = sqlite_fixture(
        &config.database.path,
        &[("B", TinKind::Itin, SHAPE), ("C", TinKind::Ssn, SHAPE)],
    )?;

    let mut allocator = Allocator::new(store, config);
    let reports = allocator.run()?;
    assert_eq!(reports.len(), 2);

    let mut store = allocator.into_store();
    for (report, kind) in reports.iter().zip([TinKind::Itin, TinKind::Ssn]) {
        assert_eq!(report.seeded, 10);
        assert_eq!(report.outcome, StreamOutcome::TargetsExhausted);
        assert_eq!(report.total_updates(), 90);
        assert_eq!(report.remaining, 0);

        assert_unique(&mut store, &report.category);
        let assigned = assigned_identifiers(&mut store, &report.category)?;
        assert_eq!(assigned.len(), 100);
        assert!(assigned.iter().all(|id| classify(id) == Some(kind)));
    }
    Ok(())
}

#[test]
fn ordered_cursor_assigns_every_target_once() -> anyhow::Result<()> {
    run_to_completion(CursorStrategy::Ordered)
}

#[test]
fn requery_cursor_assigns_every_target_once() -> anyhow::Result<()> {
    run_to_completion(CursorStrategy::Requery)
}

#[test]
fn redelivered_targets_are_guarded_against_outside_writes() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path(), &[("B", 1_000)]);
    config.cursor.strategy = CursorStrategy::Requery;
    config.engine.no_progress_rounds = 3;
    let inner = sqlite_fixture(&config.database.path, &[("B", TinKind::Itin, SHAPE)])?;
    let store = RacingStore::new(inner, 2);

    let mut allocator = Allocator::new(store, config.clone());
    let report = allocator.run()?.remove(0);
    let mut store = allocator.into_store();

    assert_eq!(store.raced(), 32);
    assert_eq!(report.outcome, StreamOutcome::TargetsExhausted);
    assert_eq!(report.total_updates(), 90 - 32);
    assert_eq!(report.remaining, 0);

    let category = Category::from("B");
    assert_unique(&mut store, &category);
    let assigned = assigned_identifiers(&mut store, &category)?;
    let outside = assigned.iter().filter(|id| id.starts_with("outside-")).count();
    assert_eq!(outside, 32);

    // Candidates rejected by the guard were never marked as used.
    let filter = MembershipFilter::load(checkpoint_path(&config.checkpoint.dir, &category))?;
    let ours: Vec<&String> = assigned.iter().filter(|id| !id.starts_with("outside-")).collect();
    assert_eq!(ours.len(), 68);
    assert!(ours.iter().all(|id| filter.might_contain(id)));
    Ok(())
}

#[test]
fn used_up_pool_ends_with_source_exhausted() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = test_config(dir.path(), &[("C", 1_000)]);
    let shape = FixtureShape {
        targets: 20,
        assigned: 5,
        candidates: 5,
    };
    let store = sqlite_fixture(&config.database.path, &[("C", TinKind::Ssn, shape)])?;

    let mut allocator = Allocator::new(store, config);
    let report = allocator.run()?.remove(0);

    assert_eq!(report.outcome, StreamOutcome::SourceExhausted);
    assert_eq!(report.streamed_updates, 0);
    assert_eq!(
        report.residual,
        Some(ResidualReport {
            sweeps: 1,
            updated: 0
        })
    );
    assert_eq!(report.remaining, 15);
    assert_eq!(report.skipped_filter, 10);
    Ok(())
}

#[test]
fn residual_sweep_can_be_disabled() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path(), &[("C", 1_000)]);
    config.residual.enabled = false;
    let cat = Category::from("C");
    let store = memory_fixture(&cat, &[], 4, vec!["x".to_string(), "y".to_string()]);

    let mut allocator = Allocator::new(store, config);
    let report = allocator.run()?.remove(0);
    assert_eq!(report.residual, None);
    assert_eq!(report.total_updates(), 2);
    assert_eq!(report.remaining, 2);
    Ok(())
}

#[test]
fn store_failure_is_fatal_and_keeps_a_checkpoint() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = test_config(dir.path(), &[("B", 1_000), ("C", 1_000)]);
    let cat = Category::from("B");
    let candidates = (0..20).map(|i| format!("cand-{i}")).collect();
    let mut store = memory_fixture(&cat, &["seed-1", "seed-2"], 10, candidates);
    store.fail_next_apply();

    let mut allocator = Allocator::new(store, config.clone());
    let err = allocator.run().unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("category B"), "{message}");
    assert!(message.contains("injected failure"), "{message}");

    let path = checkpoint_path(&config.checkpoint.dir, &cat);
    let filter = MembershipFilter::load(&path)?;
    assert!(filter.might_contain("seed-1"));
    assert!(filter.might_contain("seed-2"));

    let mut store = allocator.into_store();
    assert_eq!(store.count_unassigned(&cat)?, 10);
    // C never started.
    assert!(!checkpoint_path(&config.checkpoint.dir, &Category::from("C")).exists());
    Ok(())
}

#[test]
fn ledger_totals_never_decrease() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = test_config(dir.path(), &[("B", 1_000)]);
    let store = sqlite_fixture(&config.database.path, &[("B", TinKind::Itin, SHAPE)])?;
    let ledger = config.progress.ledger.clone().expect("ledger configured");

    let mut allocator = Allocator::new(store, config);
    let report = allocator.run()?.remove(0);

    let contents = fs::read_to_string(ledger)?;
    let mut lines = contents.lines();
    assert!(lines.next().expect("header").starts_with("timestamp,type,phase,round"));

    let mut last = 0u64;
    let mut phases = Vec::new();
    for line in lines {
        let cols: Vec<&str> = line.split(',').collect();
        assert_eq!(cols.len(), 14, "{line}");
        assert_eq!(cols[1], "B");
        let total: u64 = cols[7].parse()?;
        assert!(total >= last, "total went from {last} to {total}");
        last = total;
        phases.push(cols[2].to_string());
    }
    assert_eq!(last, report.total_updates());
    assert_eq!(phases.first().map(String::as_str), Some("seed"));
    assert!(phases.iter().any(|p| p == "assign"));
    assert!(phases.iter().any(|p| p == "checkpoint"));
    assert!(phases.iter().any(|p| p == "done"));
    Ok(())
}
