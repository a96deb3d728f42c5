//! Throughput and skip statistics for one category.
//!
//! Every round is reported on the console through `tracing` and appended to
//! an optional CSV ledger. Ledger failures are logged and otherwise ignored.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use tracing::{info, warn};

use crate::model::Category;

pub const LEDGER_HEADER: [&str; 14] = [
    "timestamp",
    "type",
    "phase",
    "round",
    "targets",
    "src_buf",
    "updated",
    "total_updated",
    "avg_rps",
    "inst_rps",
    "skipped_bloom_total",
    "skipped_window_total",
    "rss_mb",
    "filter_mb",
];

const MB: f64 = 1024.0 * 1024.0;

/// One ledger line.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub timestamp: String,
    pub category: String,
    pub phase: String,
    pub round: u64,
    pub targets: u64,
    pub src_buf: u64,
    pub updated: u64,
    pub total_updated: u64,
    pub avg_rps: f64,
    pub inst_rps: f64,
    pub skipped_filter_total: u64,
    pub skipped_window_total: u64,
    pub rss_mb: u64,
    pub filter_mb: f64,
}

impl LedgerRow {
    pub fn to_csv_line(&self) -> String {
        let cols = [
            escape_csv(&self.timestamp),
            escape_csv(&self.category),
            escape_csv(&self.phase),
            self.round.to_string(),
            self.targets.to_string(),
            self.src_buf.to_string(),
            self.updated.to_string(),
            self.total_updated.to_string(),
            format!("{:.3}", self.avg_rps),
            format!("{:.3}", self.inst_rps),
            self.skipped_filter_total.to_string(),
            self.skipped_window_total.to_string(),
            self.rss_mb.to_string(),
            format!("{:.1}", self.filter_mb),
        ];
        cols.join(",")
    }
}

/// Quote a field containing a delimiter, quote, or line break.
pub fn escape_csv(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Resident set size sampler for the current process.
pub struct ProcessMemory {
    system: System,
    pid: Pid,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from(std::process::id() as usize),
        }
    }

    /// Current resident set size in MB, or 0 when the platform reports nothing.
    pub fn resident_mb(&mut self) -> u64 {
        self.system.refresh_process(self.pid);
        self.system
            .process(self.pid)
            .map_or(0, |process| process.memory() / (1024 * 1024))
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcessMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemory").field("pid", &self.pid).finish()
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    count as f64 / elapsed.as_secs_f64().max(1e-6)
}

/// Append-only CSV file; the header is written when the file is created.
#[derive(Debug)]
struct Ledger {
    path: PathBuf,
}

impl Ledger {
    fn open(path: &Path) -> Self {
        let ledger = Self {
            path: path.to_path_buf(),
        };
        if !path.exists() {
            if let Err(err) = ledger.append_line(&LEDGER_HEADER.join(",")) {
                warn!(path = %path.display(), error = %err, "progress ledger header write failed");
            }
        }
        ledger
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    fn append(&self, row: &LedgerRow) {
        if let Err(err) = self.append_line(&row.to_csv_line()) {
            warn!(path = %self.path.display(), error = %err, "progress ledger write failed");
        }
    }
}

/// Per-category progress state.
#[derive(Debug)]
pub struct ProgressRecorder {
    category: Category,
    started: Instant,
    last_log: Instant,
    updated_at_last_log: u64,
    total_updated: u64,
    skipped_filter_total: u64,
    skipped_window_total: u64,
    interval: Duration,
    filter_bytes: u64,
    memory: ProcessMemory,
    ledger: Option<Ledger>,
}

impl ProgressRecorder {
    pub fn new(category: Category, interval: Duration, ledger: Option<&Path>) -> Self {
        let now = Instant::now();
        Self {
            category,
            started: now,
            last_log: now,
            updated_at_last_log: 0,
            total_updated: 0,
            skipped_filter_total: 0,
            skipped_window_total: 0,
            interval: interval.max(Duration::from_secs(1)),
            filter_bytes: 0,
            memory: ProcessMemory::new(),
            ledger: ledger.map(Ledger::open),
        }
    }

    pub fn add_updated(&mut self, n: u64) {
        self.total_updated += n;
    }

    pub fn add_skipped(&mut self, filter: u64, window: u64) {
        self.skipped_filter_total += filter;
        self.skipped_window_total += window;
    }

    pub fn set_filter_bytes(&mut self, bytes: u64) {
        self.filter_bytes = bytes;
    }

    pub fn total_updated(&self) -> u64 {
        self.total_updated
    }

    pub fn skipped_filter_total(&self) -> u64 {
        self.skipped_filter_total
    }

    pub fn skipped_window_total(&self) -> u64 {
        self.skipped_window_total
    }

    fn row(&mut self, phase: &str, round: u64, targets: u64, src_buf: u64, updated: u64) -> LedgerRow {
        LedgerRow {
            timestamp: timestamp(),
            category: self.category.to_string(),
            phase: phase.to_string(),
            round,
            targets,
            src_buf,
            updated,
            total_updated: self.total_updated,
            avg_rps: per_second(self.total_updated, self.started.elapsed()),
            inst_rps: 0.0,
            skipped_filter_total: self.skipped_filter_total,
            skipped_window_total: self.skipped_window_total,
            rss_mb: self.memory.resident_mb(),
            filter_mb: self.filter_bytes as f64 / MB,
        }
    }

    fn append(&self, row: &LedgerRow) {
        if let Some(ledger) = &self.ledger {
            ledger.append(row);
        }
    }

    /// Report a committed round: console line plus ledger row.
    pub fn log_commit(&mut self, round: u64, phase: &str, targets: usize, src_buf: usize, updated: u64) {
        let now = Instant::now();
        let delta = self.total_updated.saturating_sub(self.updated_at_last_log);
        let mut row = self.row(phase, round, targets as u64, src_buf as u64, updated);
        row.inst_rps = per_second(delta, now.duration_since(self.last_log));

        info!(
            category = %self.category,
            round,
            targets,
            src = src_buf,
            updated,
            total = self.total_updated,
            avg_rps = format_args!("{:.0}", row.avg_rps),
            inst_rps = format_args!("{:.0}", row.inst_rps),
            skipped_bloom = self.skipped_filter_total,
            skipped_window = self.skipped_window_total,
            rss_mb = row.rss_mb,
            "round committed"
        );
        self.append(&row);

        self.last_log = now;
        self.updated_at_last_log = self.total_updated;
    }

    /// Ledger-only marker for phase transitions and checkpoints.
    pub fn log_heartbeat(&mut self, round: u64, phase: &str) {
        let row = self.row(phase, round, 0, 0, 0);
        self.append(&row);
    }

    /// Seeding progress: `loaded` identifiers so far at `rate` per second.
    pub fn log_seed(&mut self, loaded: u64, rate: f64) {
        info!(category = %self.category, loaded, rate = format_args!("{rate:.0}"), "seeding filter");
        let mut row = self.row("seed", 0, 0, 0, 0);
        row.total_updated = loaded;
        row.avg_rps = rate;
        row.inst_rps = rate;
        self.append(&row);
    }

    pub fn log_interval(&self) -> Duration {
        self.interval
    }

    /// Snapshot when the log interval has elapsed since the last report.
    pub fn maybe_log_periodic(&mut self, round: u64, phase: &str) {
        if self.last_log.elapsed() >= self.interval {
            self.log_commit(round, phase, 0, 0, 0);
        }
    }
}
