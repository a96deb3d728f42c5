//! # Data Model
//!
//! Core types shared by the allocator: categories, target keys, source
//! positions, and the outcome of a streaming phase.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition of the allocation problem (the `entity_type` column).
///
/// Each category gets its own filter, cursors, and checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name safe to embed in a file name: anything outside `[A-Za-z0-9_-]` becomes `_`.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Stable numeric key of a target record (`seqno`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey(pub i64);

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Opaque storage position of a candidate in the source pool.
///
/// Source reads are paged strictly forward by this position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourcePosition(pub i64);

/// A candidate identifier together with the position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub position: SourcePosition,
    pub identifier: String,
}

impl SourceRow {
    pub fn new(position: i64, identifier: impl Into<String>) -> Self {
        Self {
            position: SourcePosition(position),
            identifier: identifier.into(),
        }
    }
}

/// One proposed pairing of a target with a candidate identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub target: TargetKey,
    pub identifier: String,
}

impl Assignment {
    pub fn new(target: TargetKey, identifier: impl Into<String>) -> Self {
        Self {
            target,
            identifier: identifier.into(),
        }
    }
}

/// Why the streaming phase of a category stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// The target cursor returned no more rows.
    TargetsExhausted,
    /// The candidate buffer could not be refilled (pool drained or fully filtered).
    SourceExhausted,
    /// Rounds committed without a single successful guarded update.
    NoProgress,
}

impl StreamOutcome {
    /// Phase tag written to the progress ledger.
    pub fn phase(self) -> &'static str {
        match self {
            StreamOutcome::TargetsExhausted => "done",
            StreamOutcome::SourceExhausted => "source_exhausted",
            StreamOutcome::NoProgress => "no_progress",
        }
    }
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamOutcome::TargetsExhausted => "targets_exhausted",
            StreamOutcome::SourceExhausted => "source_exhausted",
            StreamOutcome::NoProgress => "no_progress",
        };
        f.write_str(label)
    }
}
