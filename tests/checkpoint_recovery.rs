mod support;

use std::fs;

use support::{assert_unique, assigned_identifiers, sqlite_fixture};
use tempfile::tempdir;
use tino_allocator::test_support::{test_config, FixtureShape};
use tino_allocator::tin::{TinGenerator, TinKind};
use tino_allocator::{
    checkpoint_path, AllocationStore, Allocator, Category, FilterError, FilterOrigin,
    MembershipFilter, StreamOutcome,
};

use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn restart_resumes_from_saved_filter() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = test_config(dir.path(), &[("B", 1_000)]);
    let category = Category::from("B");
    let shape = FixtureShape {
        targets: 40,
        assigned: 0,
        candidates: 30,
    };
    let store = sqlite_fixture(&config.database.path, &[("B", TinKind::Ssn, shape)])?;

    let mut first = Allocator::new(store, config.clone());
    let report = first.run()?.remove(0);
    assert_eq!(report.origin, FilterOrigin::Created);
    assert_eq!(report.outcome, StreamOutcome::SourceExhausted);
    assert_eq!(report.total_updates(), 30);
    assert_eq!(report.remaining, 10);

    // Reload the pool: the same 30 identifiers again plus 20 fresh ones.
    let mut store = first.into_store();
    let used = assigned_identifiers(&mut store, &category)?;
    let fresh = TinGenerator::new(StdRng::seed_from_u64(999)).unique_batch(TinKind::Itin, 20, 1_000)?;
    store.insert_candidates(&category, used.iter().chain(fresh.iter()))?;

    let mut second = Allocator::new(store, config.clone());
    let report = second.run()?.remove(0);
    assert_eq!(report.origin, FilterOrigin::Loaded);
    assert_eq!(report.seeded, 30);
    assert_eq!(report.total_updates(), 10);
    assert_eq!(report.remaining, 0);
    assert!(report.skipped_filter >= 60);

    let mut store = second.into_store();
    assert_unique(&mut store, &category);
    let assigned = assigned_identifiers(&mut store, &category)?;
    assert_eq!(assigned.len(), 40);
    let from_fresh = assigned.iter().filter(|id| fresh.contains(id)).count();
    assert_eq!(from_fresh, 10);
    Ok(())
}

#[test]
fn saved_filter_contains_every_assigned_identifier() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = test_config(dir.path(), &[("C", 500)]);
    let category = Category::from("C");
    let shape = FixtureShape {
        targets: 60,
        assigned: 7,
        candidates: 80,
    };
    let store = sqlite_fixture(&config.database.path, &[("C", TinKind::Ssn, shape)])?;

    let mut allocator = Allocator::new(store, config.clone());
    allocator.run()?;
    let mut store = allocator.into_store();

    let filter = MembershipFilter::load(checkpoint_path(&config.checkpoint.dir, &category))?;
    assert_eq!(filter.size_bits(), 6_016);
    for identifier in assigned_identifiers(&mut store, &category)? {
        assert!(filter.might_contain(&identifier), "missing {identifier}");
    }
    Ok(())
}

#[test]
fn corrupt_checkpoint_stops_before_touching_the_store() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = test_config(dir.path(), &[("B", 1_000)]);
    let category = Category::from("B");
    let shape = FixtureShape {
        targets: 10,
        assigned: 0,
        candidates: 20,
    };
    let store = sqlite_fixture(&config.database.path, &[("B", TinKind::Itin, shape)])?;

    fs::create_dir_all(&config.checkpoint.dir)?;
    let path = checkpoint_path(&config.checkpoint.dir, &category);
    fs::write(&path, [0u8; 64])?;

    let mut allocator = Allocator::new(store, config);
    let err = allocator.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FilterError>(),
        Some(FilterError::Format { .. })
    ));

    let mut store = allocator.into_store();
    assert_eq!(store.count_unassigned(&category)?, 10);
    // The bad file is left for the operator to inspect.
    assert_eq!(fs::read(&path)?, vec![0u8; 64]);
    Ok(())
}
