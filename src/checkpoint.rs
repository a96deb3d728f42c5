//! Crash-safe persistence of a category's membership filter.
//!
//! A checkpoint is written to a sibling `.tmp` file, synced, and renamed
//! over the canonical path, so the canonical file is always either the
//! previous good checkpoint or the complete new one.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::filter::MembershipFilter;
use crate::model::Category;

/// Canonical checkpoint file for `category` inside `dir`.
pub fn checkpoint_path(dir: &Path, category: &Category) -> PathBuf {
    dir.join(format!("bloom_{}.bin", category.file_stem()))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace the checkpoint at `path` with `filter`.
pub fn checkpoint(filter: &MembershipFilter, path: &Path) -> Result<()> {
    let tmp = temp_path(path);
    {
        let file = File::create(&tmp)
            .with_context(|| format!("create checkpoint temp file {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        filter
            .write_to(&mut writer)
            .with_context(|| format!("write checkpoint {}", tmp.display()))?;
        let file = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flush checkpoint {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync checkpoint {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    sync_parent_dir(path);
    Ok(())
}

/// Best-effort checkpoint for shutdown and error paths; failures are logged.
pub fn safe_checkpoint(filter: &MembershipFilter, path: &Path) -> bool {
    match checkpoint(filter, path) {
        Ok(()) => {
            info!(
                path = %path.display(),
                mb = filter.memory_bytes() as f64 / (1024.0 * 1024.0),
                "filter checkpoint saved"
            );
            true
        }
        Err(err) => {
            error!(path = %path.display(), error = %format!("{err:#}"), "filter checkpoint failed");
            false
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// Where a category's filter came from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOrigin {
    Loaded,
    Created,
}

/// Filter sizing used when no checkpoint exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSizing {
    pub expected: u64,
    pub bits_per_entry: u32,
    pub k: u32,
}

/// Load the checkpoint at `path`, or create a fresh filter when none exists.
///
/// A present but unreadable checkpoint is an error: starting over with an
/// empty filter would re-offer identifiers that were already consumed.
pub fn load_or_create(path: &Path, sizing: FilterSizing) -> Result<(MembershipFilter, FilterOrigin)> {
    if path.exists() {
        let filter = MembershipFilter::load(path)
            .with_context(|| format!("load filter checkpoint {}", path.display()))?;
        return Ok((filter, FilterOrigin::Loaded));
    }
    let filter = MembershipFilter::create(sizing.expected, sizing.bits_per_entry, sizing.k)
        .with_context(|| format!("size filter for {} expected entries", sizing.expected))?;
    Ok((filter, FilterOrigin::Created))
}
