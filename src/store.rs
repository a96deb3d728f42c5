//! # Store Module
//!
//! The query surface the allocator needs from the backing relational
//! store, plus an in-memory implementation used by tests and benchmarks.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use rustc_hash::FxHashMap;

use crate::model::{Assignment, Category, SourcePosition, SourceRow, TargetKey};

/// Query surface over target and source records.
///
/// Every read is bounded; the allocator keeps its own cursor state
/// (last key / last position) between calls so no server-side cursor has
/// to survive a commit.
pub trait AllocationStore {
    /// Stream every non-null identifier already assigned in `category`.
    /// Returns the number of identifiers visited.
    fn for_each_assigned(&mut self, category: &Category, f: &mut dyn FnMut(&str)) -> Result<u64>;

    /// Up to `limit` unassigned target keys greater than `after`, ascending.
    fn fetch_unassigned_ordered(
        &mut self,
        category: &Category,
        after: Option<TargetKey>,
        limit: usize,
    ) -> Result<Vec<TargetKey>>;

    /// Up to `limit` unassigned target keys in whatever order is cheapest.
    fn fetch_unassigned(&mut self, category: &Category, limit: usize) -> Result<Vec<TargetKey>>;

    /// Up to `limit` candidate identifiers stored after `after`, in storage order.
    fn fetch_candidates(
        &mut self,
        category: &Category,
        after: Option<SourcePosition>,
        limit: usize,
    ) -> Result<Vec<SourceRow>>;

    /// Apply guarded updates (`identifier IS NULL`) in one transaction.
    ///
    /// Only targets belonging to `category` are touched. Returns, per
    /// assignment, whether a row was actually changed. On error nothing is
    /// committed.
    fn apply_assignments(
        &mut self,
        category: &Category,
        assignments: &[Assignment],
    ) -> Result<Vec<bool>>;

    fn count_unassigned(&mut self, category: &Category) -> Result<u64>;

    /// Identifiers assigned to more than one target in `category`, with counts.
    fn duplicate_assignments(&mut self, category: &Category) -> Result<Vec<(String, u64)>>;
}

#[derive(Debug, Clone)]
struct TargetRow {
    category: Category,
    identifier: Option<String>,
}

/// In-memory store with the same semantics as the relational one.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    targets: BTreeMap<TargetKey, TargetRow>,
    /// Position `i + 1` is `candidates[i]`.
    candidates: Vec<(Category, String)>,
    fail_next_apply: bool,
    transactions: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_target(&mut self, key: TargetKey, category: &Category, identifier: Option<&str>) {
        self.targets.insert(
            key,
            TargetRow {
                category: category.clone(),
                identifier: identifier.map(str::to_string),
            },
        );
    }

    pub fn add_candidates<I, S>(&mut self, category: &Category, identifiers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for identifier in identifiers {
            self.candidates.push((category.clone(), identifier.into()));
        }
    }

    /// Set a target's identifier behind the allocator's back.
    pub fn assign_externally(&mut self, key: TargetKey, identifier: &str) {
        if let Some(row) = self.targets.get_mut(&key) {
            row.identifier = Some(identifier.to_string());
        }
    }

    pub fn identifier_of(&self, key: TargetKey) -> Option<&str> {
        self.targets.get(&key).and_then(|row| row.identifier.as_deref())
    }

    /// Make the next `apply_assignments` call fail without writing anything.
    pub fn fail_next_apply(&mut self) {
        self.fail_next_apply = true;
    }

    /// Number of committed assignment transactions.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    fn unassigned_in<'a>(&'a self, category: &'a Category) -> impl Iterator<Item = TargetKey> + 'a {
        self.targets
            .iter()
            .filter(move |(_, row)| &row.category == category && row.identifier.is_none())
            .map(|(key, _)| *key)
    }
}

impl AllocationStore for MemoryStore {
    fn for_each_assigned(&mut self, category: &Category, f: &mut dyn FnMut(&str)) -> Result<u64> {
        let mut visited = 0;
        for row in self.targets.values() {
            if &row.category != category {
                continue;
            }
            if let Some(identifier) = &row.identifier {
                f(identifier);
                visited += 1;
            }
        }
        Ok(visited)
    }

    fn fetch_unassigned_ordered(
        &mut self,
        category: &Category,
        after: Option<TargetKey>,
        limit: usize,
    ) -> Result<Vec<TargetKey>> {
        Ok(self
            .unassigned_in(category)
            .filter(|key| after.map_or(true, |after| *key > after))
            .take(limit)
            .collect())
    }

    fn fetch_unassigned(&mut self, category: &Category, limit: usize) -> Result<Vec<TargetKey>> {
        // Newest rows first, so callers cannot rely on key order.
        let mut keys: Vec<TargetKey> = self.unassigned_in(category).collect();
        keys.reverse();
        keys.truncate(limit);
        Ok(keys)
    }

    fn fetch_candidates(
        &mut self,
        category: &Category,
        after: Option<SourcePosition>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let start = after.map_or(0, |p| p.0.max(0) as usize);
        Ok(self
            .candidates
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, (cat, _))| cat == category)
            .take(limit)
            .map(|(idx, (_, identifier))| SourceRow::new(idx as i64 + 1, identifier.clone()))
            .collect())
    }

    fn apply_assignments(
        &mut self,
        category: &Category,
        assignments: &[Assignment],
    ) -> Result<Vec<bool>> {
        if std::mem::take(&mut self.fail_next_apply) {
            bail!("injected failure applying {} assignments", assignments.len());
        }
        let mut affected = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let changed = match self.targets.get_mut(&assignment.target) {
                Some(row) if &row.category == category && row.identifier.is_none() => {
                    row.identifier = Some(assignment.identifier.clone());
                    true
                }
                _ => false,
            };
            affected.push(changed);
        }
        self.transactions += 1;
        Ok(affected)
    }

    fn count_unassigned(&mut self, category: &Category) -> Result<u64> {
        Ok(self.unassigned_in(category).count() as u64)
    }

    fn duplicate_assignments(&mut self, category: &Category) -> Result<Vec<(String, u64)>> {
        let mut counts: FxHashMap<&str, u64> = FxHashMap::default();
        for row in self.targets.values() {
            if &row.category != category {
                continue;
            }
            if let Some(identifier) = &row.identifier {
                *counts.entry(identifier.as_str()).or_default() += 1;
            }
        }
        let mut duplicates: Vec<(String, u64)> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(identifier, count)| (identifier.to_string(), count))
            .collect();
        duplicates.sort();
        Ok(duplicates)
    }
}
