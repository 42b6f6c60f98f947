//! Dump Fetcher: fan out one request per manifest entry and persist each
//! payload as a compressed dump.
//!
//! Each entry is isolated. A failure for one symbol is recorded and the run
//! moves on; only setup problems (unreadable manifest, unusable dump
//! directory) abort before any request is made.
//!
//! Workers run on a dedicated Rayon pool sized to the configured concurrency,
//! so at most `concurrency` requests are in flight. A shared
//! [`RequestThrottle`] additionally spaces request starts. Outcomes are keyed
//! by symbol, so completion order never affects the summary.
//!
//! Cancellation (Ctrl-C flag or run deadline) stops new requests from being
//! issued. In-flight requests finish; their dumps are still committed through
//! the store's temp-then-rename path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;
use stockdump_core::data::{
    DumpStore, FailureKind, FetchError, Manifest, ManifestEntry, ManifestError, QuoteProvider,
    RequestThrottle, StoreError,
};
use stockdump_core::domain::Symbol;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::progress::FetchProgress;
use crate::summary::ExitStatus;

/// Jitter removed from each backoff delay, as a percentage of the delay.
const JITTER_PERCENT: u64 = 20;

/// Granularity of interruptible sleeps.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Setup failures that abort the whole run.
#[derive(Debug, Error)]
pub enum FetchRunError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("manifest {0} has no entries; run `stockdump manifest` first")]
    EmptyManifest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to build fetch worker pool: {0}")]
    Pool(String),
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Total attempts per entry, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay after the `failed`-th failed attempt (1-based).
    pub fn ceiling(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Delay before the next attempt.
    ///
    /// Jitter only shortens the delay, so it never exceeds `max_delay`.
    /// A server-supplied `Retry-After` takes precedence when longer.
    pub fn delay_for(&self, failed: u32, error: &FetchError) -> Duration {
        let ceiling = self.ceiling(failed);
        let range = ceiling.as_millis() as u64 * JITTER_PERCENT / 100;
        let jitter = if range == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=range)
        };
        let backoff = ceiling.saturating_sub(Duration::from_millis(jitter));

        match error.retry_after_secs() {
            Some(secs) => backoff.max(Duration::from_secs(secs)),
            None => backoff,
        }
    }
}

/// Knobs for one fetch run.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// zstd level for dumps.
    pub level: i32,
    pub min_request_interval: Duration,
    pub run_timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy {
                max_retries: config.retries,
                base_delay: Duration::from_millis(config.base_delay_ms),
                max_delay: Duration::from_millis(config.max_delay_ms),
            },
            level: config.level,
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
            run_timeout: config.run_timeout(),
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

/// Entries to fetch, one per symbol.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub entries: Vec<ManifestEntry>,
    /// Older manifest entries dropped in favour of a newer one for the same symbol.
    pub superseded: usize,
}

/// Collapse the manifest to the most recent entry per symbol.
///
/// The manifest is append-only, so a symbol requested on several days has
/// several entries. Fetching all of them would race writers on one dump
/// file; only the latest request (by `requested_at`, then file position)
/// is kept. The plan is ordered by symbol.
pub fn plan_fetch(entries: Vec<ManifestEntry>) -> FetchPlan {
    let total = entries.len();
    let mut latest: BTreeMap<Symbol, ManifestEntry> = BTreeMap::new();
    for entry in entries {
        match latest.get(&entry.symbol) {
            Some(existing) if existing.requested_at > entry.requested_at => {}
            _ => {
                latest.insert(entry.symbol.clone(), entry);
            }
        }
    }
    let entries: Vec<ManifestEntry> = latest.into_values().collect();
    FetchPlan {
        superseded: total - entries.len(),
        entries,
    }
}

/// Result of fetching one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Succeeded {
        attempts: u32,
        raw_bytes: u64,
        compressed_bytes: u64,
    },
    Failed {
        kind: FailureKind,
        reason: String,
        attempts: u32,
        at: DateTime<Utc>,
    },
    /// Never attempted, or abandoned during backoff, because the run stopped.
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SucceededFetch {
    pub symbol: Symbol,
    pub attempts: u32,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedFetch {
    pub symbol: Symbol,
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedFetch {
    pub symbol: Symbol,
    pub reason: String,
}

/// Per-symbol accounting for a fetch run, sorted by symbol.
#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub superseded: usize,
    pub succeeded: Vec<SucceededFetch>,
    pub failed: Vec<FailedFetch>,
    pub skipped: Vec<SkippedFetch>,
}

impl FetchSummary {
    fn from_outcomes(
        outcomes: BTreeMap<Symbol, EntryOutcome>,
        started_at: DateTime<Utc>,
        superseded: usize,
    ) -> Self {
        let mut summary = Self {
            started_at,
            finished_at: Utc::now(),
            superseded,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        };
        for (symbol, outcome) in outcomes {
            match outcome {
                EntryOutcome::Succeeded {
                    attempts,
                    raw_bytes,
                    compressed_bytes,
                } => summary.succeeded.push(SucceededFetch {
                    symbol,
                    attempts,
                    raw_bytes,
                    compressed_bytes,
                }),
                EntryOutcome::Failed {
                    kind,
                    reason,
                    attempts,
                    at,
                } => summary.failed.push(FailedFetch {
                    symbol,
                    kind,
                    reason,
                    attempts,
                    at,
                }),
                EntryOutcome::Skipped { reason } => {
                    summary.skipped.push(SkippedFetch { symbol, reason })
                }
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// `Success` only if every planned entry produced a dump.
    pub fn exit_status(&self) -> ExitStatus {
        if self.failed.is_empty() && self.skipped.is_empty() {
            ExitStatus::Success
        } else {
            ExitStatus::Partial
        }
    }
}

/// Cooperative stop condition shared by all workers.
struct StopSignal<'a> {
    cancel: Option<&'a AtomicBool>,
    deadline: Option<Instant>,
}

impl StopSignal<'_> {
    fn check(&self) -> Option<&'static str> {
        if self.cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Some("interrupted");
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some("run timeout reached");
        }
        None
    }

    /// Sleep for `total`, waking early if the run stops.
    fn sleep(&self, total: Duration) -> Option<&'static str> {
        let until = Instant::now() + total;
        loop {
            if let Some(reason) = self.check() {
                return Some(reason);
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            std::thread::sleep((until - now).min(STOP_POLL));
        }
    }
}

struct Worker<'a> {
    store: &'a DumpStore,
    provider: &'a dyn QuoteProvider,
    options: &'a FetchOptions,
    progress: &'a dyn FetchProgress,
    throttle: &'a RequestThrottle,
    stop: &'a StopSignal<'a>,
}

impl Worker<'_> {
    fn fetch_entry(&self, entry: &ManifestEntry) -> EntryOutcome {
        let symbol = &entry.symbol;
        let max_attempts = self.options.retry.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if let Some(reason) = self.stop.check() {
                return EntryOutcome::Skipped {
                    reason: reason.to_string(),
                };
            }
            self.throttle.acquire();
            if let Some(reason) = self.stop.check() {
                return EntryOutcome::Skipped {
                    reason: reason.to_string(),
                };
            }

            attempt += 1;
            debug!(%symbol, attempt, "fetching");

            match self.provider.fetch(entry) {
                Ok(payload) => {
                    return match self.store.write_dump(
                        symbol,
                        payload.body.as_slice(),
                        self.options.level,
                    ) {
                        Ok(info) => {
                            info!(
                                %symbol,
                                attempt,
                                raw_bytes = info.raw_bytes,
                                compressed_bytes = info.compressed_bytes,
                                "dump written"
                            );
                            EntryOutcome::Succeeded {
                                attempts: attempt,
                                raw_bytes: info.raw_bytes,
                                compressed_bytes: info.compressed_bytes,
                            }
                        }
                        Err(e) => {
                            warn!(%symbol, error = %e, "dump write failed");
                            EntryOutcome::Failed {
                                kind: FailureKind::WriteFailed,
                                reason: e.to_string(),
                                attempts: attempt,
                                at: Utc::now(),
                            }
                        }
                    };
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.options.retry.delay_for(attempt, &err);
                    warn!(
                        %symbol,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient fetch failure, backing off"
                    );
                    self.progress.on_retry(symbol, attempt, delay, &err);
                    if let Some(reason) = self.stop.sleep(delay) {
                        return EntryOutcome::Skipped {
                            reason: format!("{reason} after {attempt} failed attempt(s): {err}"),
                        };
                    }
                }
                Err(err) => {
                    warn!(%symbol, attempt, error = %err, kind = ?err.kind(), "fetch failed");
                    return EntryOutcome::Failed {
                        kind: err.kind(),
                        reason: err.to_string(),
                        attempts: attempt,
                        at: Utc::now(),
                    };
                }
            }
        }
    }
}

/// Read the manifest, plan, and fetch every entry.
pub fn run_fetch(
    manifest: &Manifest,
    store: &DumpStore,
    provider: &dyn QuoteProvider,
    options: &FetchOptions,
    progress: &dyn FetchProgress,
    cancel: Option<&AtomicBool>,
) -> Result<FetchSummary, FetchRunError> {
    let entries = manifest.read_all()?;
    if entries.is_empty() {
        return Err(FetchRunError::EmptyManifest(
            manifest.path().display().to_string(),
        ));
    }
    store.ensure_root()?;

    let plan = plan_fetch(entries);
    if plan.superseded > 0 {
        info!(
            superseded = plan.superseded,
            "collapsed manifest to the latest entry per symbol"
        );
    }
    fetch_plan(plan, store, provider, options, progress, cancel)
}

/// Fetch a prepared plan. The dump directory must already exist.
pub fn fetch_plan(
    plan: FetchPlan,
    store: &DumpStore,
    provider: &dyn QuoteProvider,
    options: &FetchOptions,
    progress: &dyn FetchProgress,
    cancel: Option<&AtomicBool>,
) -> Result<FetchSummary, FetchRunError> {
    let started_at = Utc::now();
    let total = plan.entries.len();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.concurrency.max(1))
        .thread_name(|i| format!("fetch-{i}"))
        .build()
        .map_err(|e| FetchRunError::Pool(e.to_string()))?;

    let stop = StopSignal {
        cancel,
        deadline: options.run_timeout.map(|d| Instant::now() + d),
    };
    let throttle = RequestThrottle::new(options.min_request_interval);
    let worker = Worker {
        store,
        provider,
        options,
        progress,
        throttle: &throttle,
        stop: &stop,
    };
    let done = AtomicUsize::new(0);

    info!(
        provider = provider.name(),
        entries = total,
        concurrency = options.concurrency,
        "starting fetch"
    );

    let outcomes: BTreeMap<Symbol, EntryOutcome> = pool.install(|| {
        plan.entries
            .par_iter()
            .map(|entry| {
                progress.on_start(&entry.symbol, total);
                let outcome = worker.fetch_entry(entry);
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                progress.on_complete(&entry.symbol, n, total, &outcome);
                (entry.symbol.clone(), outcome)
            })
            .collect()
    });

    let summary = FetchSummary::from_outcomes(outcomes, started_at, plan.superseded);
    info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        "fetch finished"
    );
    progress.on_batch_complete(&summary);
    Ok(summary)
}
