//! Forward-only cursors over target and source records.
//!
//! Two target strategies are available:
//!
//! - [`OrderedTargetCursor`]: one logical cursor ordered by key. Each batch
//!   resumes strictly after the last key handed out, so keys are never
//!   yielded twice and the position survives any number of commits.
//! - [`RequeryTargetCursor`]: every batch is a fresh bounded "first N still
//!   unassigned" query. Keys that were fetched but not assigned can come back;
//!   the guarded update makes that harmless.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::filter::MembershipFilter;
use crate::model::{Category, SourcePosition, SourceRow, TargetKey};
use crate::store::AllocationStore;

/// Which target cursor implementation a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CursorStrategy {
    #[default]
    Ordered,
    Requery,
}

impl fmt::Display for CursorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorStrategy::Ordered => f.write_str("ordered"),
            CursorStrategy::Requery => f.write_str("requery"),
        }
    }
}

impl FromStr for CursorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ordered" => Ok(CursorStrategy::Ordered),
            "requery" => Ok(CursorStrategy::Requery),
            other => Err(format!(
                "unknown cursor strategy '{other}' (expected 'ordered' or 'requery')"
            )),
        }
    }
}

/// Producer of target keys lacking an identifier, for one category.
pub trait TargetCursor {
    /// Up to `limit` keys. An empty result marks the cursor exhausted and
    /// every later call returns empty as well.
    fn fetch_next_batch(
        &mut self,
        store: &mut dyn AllocationStore,
        limit: usize,
    ) -> Result<Vec<TargetKey>>;

    fn is_exhausted(&self) -> bool;

    fn strategy(&self) -> CursorStrategy;
}

/// Build the target cursor for `strategy`.
pub fn target_cursor(
    strategy: CursorStrategy,
    category: Category,
    page_size: usize,
) -> Box<dyn TargetCursor> {
    match strategy {
        CursorStrategy::Ordered => Box::new(OrderedTargetCursor::new(category, page_size)),
        CursorStrategy::Requery => Box::new(RequeryTargetCursor::new(category)),
    }
}

/// Keyset-paged cursor ordered by target key.
#[derive(Debug)]
pub struct OrderedTargetCursor {
    category: Category,
    last: Option<TargetKey>,
    page_size: usize,
    exhausted: bool,
}

impl OrderedTargetCursor {
    pub fn new(category: Category, page_size: usize) -> Self {
        Self {
            category,
            last: None,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Last key handed out so far.
    pub fn position(&self) -> Option<TargetKey> {
        self.last
    }
}

impl TargetCursor for OrderedTargetCursor {
    fn fetch_next_batch(
        &mut self,
        store: &mut dyn AllocationStore,
        limit: usize,
    ) -> Result<Vec<TargetKey>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(limit.min(self.page_size * 4));
        while out.len() < limit {
            let want = (limit - out.len()).min(self.page_size);
            let page = store.fetch_unassigned_ordered(&self.category, self.last, want)?;
            let got = page.len();
            if let Some(last) = page.last() {
                self.last = Some(*last);
            }
            out.extend(page);
            if got < want {
                break;
            }
        }
        if out.is_empty() {
            self.exhausted = true;
        }
        Ok(out)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn strategy(&self) -> CursorStrategy {
        CursorStrategy::Ordered
    }
}

/// Re-issues a bounded unordered query on every batch.
#[derive(Debug)]
pub struct RequeryTargetCursor {
    category: Category,
    exhausted: bool,
}

impl RequeryTargetCursor {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            exhausted: false,
        }
    }
}

impl TargetCursor for RequeryTargetCursor {
    fn fetch_next_batch(
        &mut self,
        store: &mut dyn AllocationStore,
        limit: usize,
    ) -> Result<Vec<TargetKey>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let keys = store.fetch_unassigned(&self.category, limit)?;
        if keys.is_empty() {
            self.exhausted = true;
        }
        Ok(keys)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn strategy(&self) -> CursorStrategy {
        CursorStrategy::Requery
    }
}

/// Per-call skip counts from [`SourceCursor::fill_buffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillStats {
    pub added: u64,
    /// Already present in the in-memory buffer.
    pub skipped_window: u64,
    /// Reported as used by the filter.
    pub skipped_filter: u64,
}

/// Forward-only reader over a category's candidate pool.
#[derive(Debug)]
pub struct SourceCursor {
    category: Category,
    last: Option<SourcePosition>,
    page_size: usize,
    pending: VecDeque<SourceRow>,
    exhausted: bool,
    rows_read: u64,
}

impl SourceCursor {
    pub fn new(category: Category, page_size: usize) -> Self {
        Self {
            category,
            last: None,
            page_size: page_size.max(1),
            pending: VecDeque::new(),
            exhausted: false,
            rows_read: 0,
        }
    }

    /// True once the pool has been read to the end and nothing is pending.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.pending.is_empty()
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn next_row(&mut self, store: &mut dyn AllocationStore) -> Result<Option<SourceRow>> {
        if let Some(row) = self.pending.pop_front() {
            return Ok(Some(row));
        }
        if self.exhausted {
            return Ok(None);
        }
        let page = store.fetch_candidates(&self.category, self.last, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last = Some(last.position);
        }
        self.rows_read += page.len() as u64;
        self.pending.extend(page);
        Ok(self.pending.pop_front())
    }

    /// Read forward until `buffer` holds `target_size` candidates or the
    /// pool runs out, skipping window duplicates and filter hits.
    ///
    /// Rows read ahead but not consumed stay pending for the next call.
    pub fn fill_buffer(
        &mut self,
        store: &mut dyn AllocationStore,
        filter: &MembershipFilter,
        buffer: &mut Vec<String>,
        target_size: usize,
    ) -> Result<FillStats> {
        let mut stats = FillStats::default();
        if buffer.len() >= target_size {
            return Ok(stats);
        }
        let mut window: FxHashSet<String> = buffer.iter().cloned().collect();
        while buffer.len() < target_size {
            let Some(row) = self.next_row(store)? else {
                break;
            };
            if window.contains(&row.identifier) {
                stats.skipped_window += 1;
                continue;
            }
            if filter.might_contain(&row.identifier) {
                stats.skipped_filter += 1;
                continue;
            }
            window.insert(row.identifier.clone());
            buffer.push(row.identifier);
            stats.added += 1;
        }
        Ok(stats)
    }
}
