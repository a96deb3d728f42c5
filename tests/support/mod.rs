use std::path::Path;

use tino_allocator::model::Category;
use tino_allocator::test_support::{populate_sqlite, FixtureShape};
use tino_allocator::tin::TinKind;
use tino_allocator::{AllocationStore, SqliteStore};

/// Fresh database at `path` with one populated category per entry.
#[allow(dead_code)]
pub fn sqlite_fixture(
    path: &Path,
    categories: &[(&str, TinKind, FixtureShape)],
) -> anyhow::Result<SqliteStore> {
    let mut store = SqliteStore::open(path)?;
    store.init_schema()?;
    let mut next_key = 1;
    for (offset, (name, kind, shape)) in categories.iter().enumerate() {
        next_key = populate_sqlite(
            &mut store,
            &Category::from(*name),
            *kind,
            *shape,
            next_key,
            100 + offset as u64,
        )?;
    }
    Ok(store)
}

#[allow(dead_code)]
pub fn assigned_identifiers(
    store: &mut dyn AllocationStore,
    category: &Category,
) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    store.for_each_assigned(category, &mut |id| out.push(id.to_string()))?;
    out.sort();
    Ok(out)
}

/// Panics if any identifier is assigned twice within `category`.
#[allow(dead_code)]
pub fn assert_unique(store: &mut dyn AllocationStore, category: &Category) {
    let duplicates = store
        .duplicate_assignments(category)
        .expect("duplicate scan");
    assert!(
        duplicates.is_empty(),
        "duplicate identifiers in {category}: {duplicates:?}"
    );
}
