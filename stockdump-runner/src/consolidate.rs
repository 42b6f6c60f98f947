//! Consolidator: merge every dump in the store into one table.
//!
//! Each dump is decoded independently into a [`SymbolOutcome`]; a dump that
//! fails to decompress or parse becomes `Skipped` with a warning and
//! contributes no rows. The outcomes are folded by [`TableBuilder`], which
//! fixes the row order (symbol, then date) regardless of discovery order.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use stockdump_core::data::{
    parse_payload, DumpFile, DumpFormat, DumpStore, SkippedSymbol, StoreError, SymbolOutcome,
    TableBuild, TableBuilder, TableError, TableFormat,
};
use stockdump_core::domain::Symbol;
use thiserror::Error;
use tracing::{info, warn};

use crate::summary::ExitStatus;

#[derive(Debug, Error)]
pub enum ConsolidateError {
    #[error("no dumps found in {0}; run `stockdump fetch` first")]
    NoDumps(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidateOptions {
    pub format: TableFormat,
    /// Force a payload format instead of sniffing each dump.
    pub hint: Option<DumpFormat>,
    /// Skip dumps whose decompressed payload exceeds this many bytes.
    pub max_payload_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncludedSymbol {
    pub symbol: Symbol,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationSummary {
    pub output: PathBuf,
    pub format: TableFormat,
    pub rows: usize,
    pub bytes: u64,
    pub included: Vec<IncludedSymbol>,
    pub skipped: Vec<SkippedSymbol>,
}

impl ConsolidationSummary {
    /// Skipped dumps are warnings, not failures, unless `strict`.
    pub fn exit_status(&self, strict: bool) -> ExitStatus {
        if strict && !self.skipped.is_empty() {
            ExitStatus::Partial
        } else {
            ExitStatus::Success
        }
    }
}

/// Decode one dump into a per-symbol outcome.
pub fn load_outcome(dump: &DumpFile, options: &ConsolidateOptions) -> SymbolOutcome {
    let symbol = dump.symbol.clone();
    let payload = match stockdump_core::data::store::read_payload(
        &dump.path,
        symbol.as_str(),
        options.max_payload_bytes,
    ) {
        Ok(p) => p,
        Err(e) => {
            return SymbolOutcome::Skipped {
                symbol,
                reason: e.to_string(),
            }
        }
    };

    match parse_payload(&symbol, &payload, options.hint) {
        Ok(records) => SymbolOutcome::Parsed { symbol, records },
        Err(e) => SymbolOutcome::Skipped {
            reason: format!("parse failed: {e}"),
            symbol,
        },
    }
}

/// Decode every dump in the store and fold the results.
pub fn build_table(
    store: &DumpStore,
    options: &ConsolidateOptions,
) -> Result<TableBuild, ConsolidateError> {
    let dumps = store.list()?;
    if dumps.is_empty() {
        return Err(ConsolidateError::NoDumps(store.root().display().to_string()));
    }
    info!(dumps = dumps.len(), root = %store.root().display(), "consolidating");

    let outcomes: Vec<SymbolOutcome> = dumps
        .par_iter()
        .map(|dump| load_outcome(dump, options))
        .collect();

    let mut builder = TableBuilder::new();
    for outcome in outcomes {
        if let SymbolOutcome::Skipped { symbol, reason } = &outcome {
            warn!(%symbol, %reason, "skipping dump");
        }
        builder.push(outcome);
    }
    Ok(builder.finish())
}

/// Build the table and write it atomically to `output`.
pub fn run_consolidate(
    store: &DumpStore,
    output: &Path,
    options: &ConsolidateOptions,
) -> Result<ConsolidationSummary, ConsolidateError> {
    let build = build_table(store, options)?;
    let bytes = build.table.write(output, options.format)?;

    let summary = ConsolidationSummary {
        output: output.to_path_buf(),
        format: options.format,
        rows: build.table.len(),
        bytes,
        included: build
            .included
            .into_iter()
            .map(|(symbol, rows)| IncludedSymbol { symbol, rows })
            .collect(),
        skipped: build.skipped,
    };
    info!(
        rows = summary.rows,
        symbols = summary.included.len(),
        skipped = summary.skipped.len(),
        "consolidation finished"
    );
    Ok(summary)
}
