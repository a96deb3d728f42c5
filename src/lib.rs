//! # TINO Allocator
//!
//! Assigns unique identifiers from a finite candidate pool to target records
//! that lack one, in bounded rounds over a relational store.
//!
//! A persisted probabilistic filter remembers which candidates are used, so a
//! run never needs to sort or join the pool against the targets, and can be
//! restarted from its last checkpoint. The database-level guarded update
//! (`identifier IS NULL`) is the only thing that decides whether a candidate
//! was consumed.

pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod filter;
pub mod model;
pub mod progress;
pub mod residual;
pub mod sqlite;
pub mod store;
pub mod test_support;
pub mod tin;

// Re-export main types for convenience
pub use checkpoint::{checkpoint, checkpoint_path, load_or_create, safe_checkpoint, FilterOrigin};
pub use config::{AllocatorConfig, CategoryConfig, ConfigError, ConfigOverrides};
pub use cursor::{CursorStrategy, SourceCursor, TargetCursor};
pub use engine::{Allocator, CategoryReport, CategoryRun};
pub use filter::{FilterError, MembershipFilter};
pub use model::{Assignment, Category, StreamOutcome, TargetKey};
pub use residual::{ResidualReport, ResidualSweeper};
pub use sqlite::SqliteStore;
pub use store::{AllocationStore, MemoryStore};
