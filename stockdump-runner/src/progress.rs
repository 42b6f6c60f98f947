//! Per-symbol progress reporting for fetch runs.

use std::time::Duration;

use stockdump_core::data::FetchError;
use stockdump_core::domain::Symbol;

use crate::fetch::{EntryOutcome, FetchSummary};

/// Callback for fetch progress. Called from worker threads.
pub trait FetchProgress: Send + Sync {
    /// A worker picked up `symbol`.
    fn on_start(&self, symbol: &Symbol, total: usize);

    /// A transient failure will be retried after `delay`.
    fn on_retry(&self, symbol: &Symbol, attempt: u32, delay: Duration, error: &FetchError);

    /// `symbol` finished; `done` counts completed entries including this one.
    fn on_complete(&self, symbol: &Symbol, done: usize, total: usize, outcome: &EntryOutcome);

    /// The whole batch is done.
    fn on_batch_complete(&self, summary: &FetchSummary);
}

/// Simple progress reporter that prints to stdout.
pub struct StdoutProgress;

impl FetchProgress for StdoutProgress {
    fn on_start(&self, _symbol: &Symbol, _total: usize) {}

    fn on_retry(&self, symbol: &Symbol, attempt: u32, delay: Duration, error: &FetchError) {
        println!(
            "  {symbol}: {error}, retrying in {:.1}s (attempt {})",
            delay.as_secs_f64(),
            attempt + 1
        );
    }

    fn on_complete(&self, symbol: &Symbol, done: usize, total: usize, outcome: &EntryOutcome) {
        match outcome {
            EntryOutcome::Succeeded {
                compressed_bytes, ..
            } => println!("[{done}/{total}] {symbol} OK ({compressed_bytes} bytes)"),
            EntryOutcome::Failed { reason, .. } => {
                println!("[{done}/{total}] {symbol} FAILED: {reason}")
            }
            EntryOutcome::Skipped { reason } => {
                println!("[{done}/{total}] {symbol} skipped: {reason}")
            }
        }
    }

    fn on_batch_complete(&self, summary: &FetchSummary) {
        println!(
            "\nFetch complete: {} succeeded, {} failed, {} skipped",
            summary.succeeded.len(),
            summary.failed.len(),
            summary.skipped.len()
        );
        for f in &summary.failed {
            println!("  {} ({:?}): {}", f.symbol, f.kind, f.reason);
        }
    }
}

/// Discards all progress events.
pub struct SilentProgress;

impl FetchProgress for SilentProgress {
    fn on_start(&self, _symbol: &Symbol, _total: usize) {}
    fn on_retry(&self, _symbol: &Symbol, _attempt: u32, _delay: Duration, _error: &FetchError) {}
    fn on_complete(&self, _symbol: &Symbol, _done: usize, _total: usize, _outcome: &EntryOutcome) {}
    fn on_batch_complete(&self, _summary: &FetchSummary) {}
}
