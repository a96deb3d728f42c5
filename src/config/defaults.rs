//! Default constants for allocator configuration.
//!
//! All tuning numbers are centralized here with documentation.

// =============================================================================
// Store Defaults
// =============================================================================

/// Default SQLite database file
pub const DEFAULT_DATABASE_PATH: &str = "tino.db";

/// Default categories processed when none are configured
pub const DEFAULT_CATEGORIES: [&str; 2] = ["B", "C"];

/// Default expected number of identifiers per category.
/// Sizes the membership filter when no checkpoint exists.
pub const DEFAULT_EXPECTED_PER_CATEGORY: u64 = 200_000_000;

// =============================================================================
// Batch Defaults
// =============================================================================

/// Target keys pulled per round
pub const DEFAULT_TARGET_BATCH: usize = 100_000;

/// Minimum candidate buffer size per round.
/// Kept above the target batch so filter skips rarely starve a round.
pub const DEFAULT_CANDIDATE_BATCH: usize = 150_000;

/// Rows fetched per query when paging the target cursor
pub const DEFAULT_TARGET_PAGE_SIZE: usize = 20_000;

/// Rows fetched per query when paging the source cursor
pub const DEFAULT_SOURCE_PAGE_SIZE: usize = 20_000;

// =============================================================================
// Filter Defaults
// =============================================================================

/// Bits per expected entry.
/// With k = 7 this gives roughly 0.3% false positives at capacity.
pub const DEFAULT_BITS_PER_ENTRY: u32 = 12;

/// Hash probes per key
pub const DEFAULT_HASH_COUNT: u32 = 7;

// =============================================================================
// Checkpoint Defaults
// =============================================================================

/// Directory holding `bloom_<category>.bin` files
pub const DEFAULT_CHECKPOINT_DIR: &str = "./bloom";

/// Rounds between filter checkpoints
pub const DEFAULT_CHECKPOINT_ROUNDS: u64 = 2;

// =============================================================================
// Residual Sweep Defaults
// =============================================================================

/// Targets fetched per residual sweep
pub const DEFAULT_RESIDUAL_LIMIT: usize = 50_000;

/// Maximum residual sweeps per category
pub const DEFAULT_RESIDUAL_ROUNDS: u32 = 50;

// =============================================================================
// Progress Defaults
// =============================================================================

/// Append-only CSV ledger
pub const DEFAULT_LEDGER_PATH: &str = "tino_progress.csv";

/// Seconds between periodic progress snapshots
pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 30;

// =============================================================================
// Engine Defaults
// =============================================================================

/// Consecutive zero-update rounds that end the streaming phase
pub const DEFAULT_NO_PROGRESS_ROUNDS: u32 = 1;
