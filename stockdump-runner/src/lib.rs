//! Stockdump Runner: fetch orchestration, consolidation, preview, config.
//!
//! This crate builds on `stockdump-core` to provide:
//! - Dump Fetcher with a bounded worker pool, retries and cancellation
//! - Consolidator folding per-symbol outcomes into one table
//! - Preview of raw or parsed dumps
//! - TOML pipeline configuration
//! - Run summaries and exit-status mapping

pub mod config;
pub mod consolidate;
pub mod fetch;
pub mod preview;
pub mod progress;
pub mod summary;

pub use config::{ConfigError, ConsolidateConfig, FetchConfig, PathsConfig, PipelineConfig};
pub use consolidate::{
    build_table, run_consolidate, ConsolidateError, ConsolidateOptions, ConsolidationSummary,
    IncludedSymbol,
};
pub use fetch::{
    fetch_plan, plan_fetch, run_fetch, EntryOutcome, FailedFetch, FetchOptions, FetchPlan,
    FetchRunError, FetchSummary, RetryPolicy, SkippedFetch, SucceededFetch,
};
pub use preview::{preview_parsed, preview_raw, render_records, ParsedPreview, PreviewError, RawPreview};
pub use progress::{FetchProgress, SilentProgress, StdoutProgress};
pub use summary::{write_report, ExitStatus, ReportError};
