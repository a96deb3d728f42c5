//! # Round Engine
//!
//! Seeds a category's filter from existing assignments, then runs
//! fixed-size rounds until the targets or the candidate pool run out:
//!
//! 1. pull a batch of unassigned target keys
//! 2. top the candidate buffer up, skipping window duplicates and filter hits
//! 3. shuffle both lists and pair them from the tail
//! 4. apply guarded updates in one transaction
//! 5. mark a candidate used only when its update changed a row
//! 6. checkpoint the filter every few rounds and before stopping
//!
//! [`Allocator`] drives every configured category through seeding,
//! streaming, and the residual sweep, one category at a time.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use crate::checkpoint::{checkpoint_path, load_or_create, safe_checkpoint, FilterOrigin};
use crate::config::{AllocatorConfig, CategoryConfig};
use crate::cursor::{target_cursor, SourceCursor, TargetCursor};
use crate::filter::MembershipFilter;
use crate::model::{Assignment, Category, StreamOutcome, TargetKey};
use crate::progress::ProgressRecorder;
use crate::residual::{ResidualReport, ResidualSweeper};
use crate::store::AllocationStore;

const SEED_LOG_STRIDE: u64 = 4096;

/// Mutable state of one category's run, passed explicitly through every phase.
#[derive(Debug)]
pub struct CategoryRun {
    pub category: Category,
    pub filter: MembershipFilter,
    pub checkpoint_path: PathBuf,
    pub progress: ProgressRecorder,
    pub round: u64,
    pub seeded: u64,
    pub streamed_updates: u64,
    pub residual_updates: u64,
    zero_update_streak: u32,
}

impl CategoryRun {
    pub fn new(
        category: Category,
        filter: MembershipFilter,
        checkpoint_path: PathBuf,
        mut progress: ProgressRecorder,
    ) -> Self {
        progress.set_filter_bytes(filter.memory_bytes());
        Self {
            category,
            filter,
            checkpoint_path,
            progress,
            round: 0,
            seeded: 0,
            streamed_updates: 0,
            residual_updates: 0,
            zero_update_streak: 0,
        }
    }

    /// Best-effort checkpoint followed by a ledger marker.
    pub fn checkpoint(&mut self, phase: &str) -> bool {
        let saved = safe_checkpoint(&self.filter, &self.checkpoint_path);
        self.progress.log_heartbeat(self.round, phase);
        saved
    }

    pub fn total_updates(&self) -> u64 {
        self.streamed_updates + self.residual_updates
    }
}

/// Knobs for the streaming phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub target_batch: usize,
    pub candidate_batch: usize,
    pub checkpoint_rounds: u64,
    pub no_progress_rounds: u32,
}

impl StreamSettings {
    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self {
            target_batch: config.batch.target_batch,
            candidate_batch: config.batch.candidate_batch,
            checkpoint_rounds: config.checkpoint.rounds.max(1),
            no_progress_rounds: config.engine.no_progress_rounds.max(1),
        }
    }
}

/// Result of one assignment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundResult {
    /// Pairs submitted to the store.
    pub paired: usize,
    /// Pairs whose guarded update changed a row.
    pub updated: u64,
    /// Candidate buffer length before consumed candidates were removed.
    pub buffer_len: usize,
}

/// Insert every identifier already assigned in the category into the filter.
pub fn seed_filter(store: &mut dyn AllocationStore, run: &mut CategoryRun) -> Result<u64> {
    info!(category = %run.category, "seeding filter from existing assignments");
    let started = Instant::now();
    let interval = run.progress.log_interval();
    let mut last_log = started;
    let mut loaded = 0u64;

    let CategoryRun {
        category,
        filter,
        progress,
        ..
    } = &mut *run;
    store
        .for_each_assigned(category, &mut |identifier| {
            filter.insert(identifier);
            loaded += 1;
            if loaded % SEED_LOG_STRIDE == 0 && last_log.elapsed() >= interval {
                let rate = loaded as f64 / started.elapsed().as_secs_f64().max(1e-6);
                progress.log_seed(loaded, rate);
                last_log = Instant::now();
            }
        })
        .with_context(|| format!("seed filter for category {category}"))?;

    let elapsed = started.elapsed().as_secs_f64();
    run.seeded = loaded;
    run.progress.log_heartbeat(0, "seed");
    info!(
        category = %run.category,
        loaded,
        secs = format_args!("{elapsed:.1}"),
        "filter seeded"
    );
    Ok(loaded)
}

/// Shuffle, pair from the tail, apply guarded updates, and record successes.
///
/// The filter is only touched after the store confirms a row changed. On a
/// store error neither the filter nor the buffer contents change. Candidates
/// whose update was rejected stay in the buffer.
pub fn assign_pairs<R: Rng + ?Sized>(
    store: &mut dyn AllocationStore,
    category: &Category,
    filter: &mut MembershipFilter,
    targets: &mut [TargetKey],
    buffer: &mut Vec<String>,
    rng: &mut R,
) -> Result<RoundResult> {
    targets.shuffle(rng);
    buffer.shuffle(rng);

    let buffer_len = buffer.len();
    let paired = targets.len().min(buffer_len);
    if paired == 0 {
        return Ok(RoundResult {
            paired: 0,
            updated: 0,
            buffer_len,
        });
    }

    let target_tail = targets.len() - paired;
    let buffer_tail = buffer_len - paired;
    let assignments: Vec<Assignment> = targets[target_tail..]
        .iter()
        .zip(&buffer[buffer_tail..])
        .map(|(target, identifier)| Assignment::new(*target, identifier.clone()))
        .collect();

    let affected = store.apply_assignments(category, &assignments)?;
    if affected.len() != assignments.len() {
        bail!(
            "store reported {} update results for {} assignments",
            affected.len(),
            assignments.len()
        );
    }

    let mut updated = 0;
    let mut rejected = Vec::new();
    for (assignment, changed) in assignments.into_iter().zip(affected) {
        if changed {
            filter.insert(&assignment.identifier);
            updated += 1;
        } else {
            rejected.push(assignment.identifier);
        }
    }
    buffer.truncate(buffer_tail);
    buffer.extend(rejected);

    Ok(RoundResult {
        paired,
        updated,
        buffer_len,
    })
}

/// Run rounds until targets run out, candidates run out, or no progress is made.
pub fn run_streaming<R: Rng + ?Sized>(
    store: &mut dyn AllocationStore,
    run: &mut CategoryRun,
    targets: &mut dyn TargetCursor,
    source: &mut SourceCursor,
    settings: StreamSettings,
    rng: &mut R,
) -> Result<StreamOutcome> {
    let mut buffer: Vec<String> = Vec::with_capacity(settings.candidate_batch);

    loop {
        run.round += 1;
        let round = run.round;

        let mut batch = targets
            .fetch_next_batch(store, settings.target_batch)
            .with_context(|| format!("fetch targets for {} round {round}", run.category))?;
        if batch.is_empty() {
            return Ok(finish(run, StreamOutcome::TargetsExhausted));
        }

        let want = settings.candidate_batch.max(batch.len());
        let fill = source
            .fill_buffer(store, &run.filter, &mut buffer, want)
            .with_context(|| format!("read candidates for {} round {round}", run.category))?;
        run.progress.add_skipped(fill.skipped_filter, fill.skipped_window);

        if buffer.is_empty() {
            return Ok(finish(run, StreamOutcome::SourceExhausted));
        }

        let result = assign_pairs(
            store,
            &run.category,
            &mut run.filter,
            &mut batch,
            &mut buffer,
            rng,
        )
        .with_context(|| format!("assign {} round {round}", run.category))?;

        run.streamed_updates += result.updated;
        run.progress.add_updated(result.updated);
        run.progress
            .log_commit(round, "assign", batch.len(), result.buffer_len, result.updated);

        if round % settings.checkpoint_rounds == 0 {
            run.checkpoint("checkpoint");
        }

        if result.updated == 0 {
            run.zero_update_streak += 1;
            if run.zero_update_streak >= settings.no_progress_rounds {
                return Ok(finish(run, StreamOutcome::NoProgress));
            }
            warn!(
                category = %run.category,
                round,
                streak = run.zero_update_streak,
                "round made no progress"
            );
        } else {
            run.zero_update_streak = 0;
        }

        run.progress.maybe_log_periodic(round, "running");
    }
}

fn finish(run: &mut CategoryRun, outcome: StreamOutcome) -> StreamOutcome {
    run.checkpoint(outcome.phase());
    info!(
        category = %run.category,
        round = run.round,
        updated = run.streamed_updates,
        outcome = %outcome,
        "streaming phase finished"
    );
    outcome
}

/// Summary of one category's run.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryReport {
    pub category: Category,
    pub origin: FilterOrigin,
    pub seeded: u64,
    pub rounds: u64,
    pub streamed_updates: u64,
    pub residual: Option<ResidualReport>,
    pub skipped_filter: u64,
    pub skipped_window: u64,
    pub outcome: StreamOutcome,
    pub remaining: u64,
    pub filter_fill_ratio: f64,
}

impl CategoryReport {
    pub fn total_updates(&self) -> u64 {
        self.streamed_updates + self.residual.map_or(0, |r| r.updated)
    }
}

impl fmt::Display for CategoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: seeded={} rounds={} streamed={} residual={} outcome={} remaining={} \
             skipped(bloom={}, window={}) fill={:.3}",
            self.category,
            self.seeded,
            self.rounds,
            self.streamed_updates,
            self.residual.map_or(0, |r| r.updated),
            self.outcome,
            self.remaining,
            self.skipped_filter,
            self.skipped_window,
            self.filter_fill_ratio,
        )
    }
}

/// Drives every configured category through seed, streaming, and residual phases.
pub struct Allocator<S: AllocationStore> {
    store: S,
    config: AllocatorConfig,
    rng: StdRng,
}

impl<S: AllocationStore> Allocator<S> {
    pub fn new(store: S, config: AllocatorConfig) -> Self {
        let rng = match config.engine.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { store, config, rng }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Process every category in order; the first fatal error stops the run.
    pub fn run(&mut self) -> Result<Vec<CategoryReport>> {
        fs::create_dir_all(&self.config.checkpoint.dir).with_context(|| {
            format!(
                "create checkpoint directory {}",
                self.config.checkpoint.dir.display()
            )
        })?;
        let categories = self.config.categories.clone();
        let mut reports = Vec::with_capacity(categories.len());
        for category in &categories {
            reports.push(self.run_category(category)?);
        }
        Ok(reports)
    }

    /// Load or create the category's filter, then run all phases.
    ///
    /// On a fatal error the filter is checkpointed before the error is returned;
    /// it only holds identifiers whose updates were committed.
    pub fn run_category(&mut self, category: &CategoryConfig) -> Result<CategoryReport> {
        let name = category.name.clone();
        info!(category = %name, "category started");

        let path = checkpoint_path(&self.config.checkpoint.dir, &name);
        let (filter, origin) = load_or_create(&path, self.config.filter_sizing(category))?;
        match origin {
            FilterOrigin::Loaded => info!(
                category = %name,
                bits = filter.size_bits(),
                mb = filter.memory_bytes() as f64 / (1024.0 * 1024.0),
                k = filter.k(),
                "loaded filter checkpoint"
            ),
            FilterOrigin::Created => info!(
                category = %name,
                expected = category.expected,
                bits = filter.size_bits(),
                mb = filter.memory_bytes() as f64 / (1024.0 * 1024.0),
                k = filter.k(),
                "created new filter"
            ),
        }

        let progress = ProgressRecorder::new(
            name.clone(),
            self.config.progress.log_interval(),
            self.config.progress.ledger.as_deref(),
        );
        let mut run = CategoryRun::new(name.clone(), filter, path, progress);

        match self.drive(&mut run, origin) {
            Ok(report) => {
                info!(category = %name, "{report}");
                Ok(report)
            }
            Err(err) => {
                error!(category = %name, error = %format!("{err:#}"), "category failed");
                safe_checkpoint(&run.filter, &run.checkpoint_path);
                Err(err.context(format!("category {name}")))
            }
        }
    }

    fn drive(&mut self, run: &mut CategoryRun, origin: FilterOrigin) -> Result<CategoryReport> {
        seed_filter(&mut self.store, run)?;

        let mut targets = target_cursor(
            self.config.cursor.strategy,
            run.category.clone(),
            self.config.batch.target_page_size,
        );
        let mut source = SourceCursor::new(run.category.clone(), self.config.batch.source_page_size);
        let outcome = run_streaming(
            &mut self.store,
            run,
            targets.as_mut(),
            &mut source,
            StreamSettings::from_config(&self.config),
            &mut self.rng,
        )?;

        let residual = if self.config.residual.enabled {
            let sweeper = ResidualSweeper::from_config(&self.config);
            let report = sweeper.run(&mut self.store, run, &mut self.rng)?;
            Some(report)
        } else {
            None
        };

        let remaining = self
            .store
            .count_unassigned(&run.category)
            .with_context(|| format!("count unassigned targets for {}", run.category))?;

        Ok(CategoryReport {
            category: run.category.clone(),
            origin,
            seeded: run.seeded,
            rounds: run.round,
            streamed_updates: run.streamed_updates,
            residual,
            skipped_filter: run.progress.skipped_filter_total(),
            skipped_window: run.progress.skipped_window_total(),
            outcome,
            remaining,
            filter_fill_ratio: run.filter.fill_ratio(),
        })
    }
}
