//! Consolidated quote table and its on-disk encodings.
//!
//! One in-memory [`ConsolidatedTable`] feeds every output variant:
//! - Parquet (zstd)
//! - Feather / Arrow IPC (zstd)
//! - CSV (row-oriented interchange)
//!
//! Writes are atomic: the encoder targets a temp file in the destination
//! directory which is persisted over the target only after a full flush.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{QuoteSchema, SchemaError};
use crate::domain::{QuoteRecord, Symbol};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to encode {format} table: {reason}")]
    Encode { format: TableFormat, reason: String },

    #[error("failed to decode {format} table: {reason}")]
    Decode { format: TableFormat, reason: String },

    #[error("I/O error at {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("table schema mismatch: {0}")]
    Schema(#[from] SchemaError),

    #[error("invalid row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },
}

/// On-disk encoding of the consolidated table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    #[default]
    Parquet,
    Feather,
    Csv,
}

impl TableFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableFormat::Parquet => "parquet",
            TableFormat::Feather => "feather",
            TableFormat::Csv => "csv",
        }
    }

    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "parquet" | "pq" => Some(TableFormat::Parquet),
            "feather" | "arrow" | "ipc" => Some(TableFormat::Feather),
            "csv" => Some(TableFormat::Csv),
            _ => None,
        }
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parquet" => Ok(TableFormat::Parquet),
            "feather" | "arrow" | "ipc" => Ok(TableFormat::Feather),
            "csv" => Ok(TableFormat::Csv),
            other => Err(format!(
                "unknown table format '{other}' (expected parquet, feather or csv)"
            )),
        }
    }
}

/// Per-symbol result of decoding one dump.
#[derive(Debug, Clone)]
pub enum SymbolOutcome {
    Parsed {
        symbol: Symbol,
        records: Vec<QuoteRecord>,
    },
    Skipped {
        symbol: Symbol,
        reason: String,
    },
}

impl SymbolOutcome {
    pub fn symbol(&self) -> &Symbol {
        match self {
            SymbolOutcome::Parsed { symbol, .. } | SymbolOutcome::Skipped { symbol, .. } => symbol,
        }
    }
}

/// Symbol excluded from the table, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSymbol {
    pub symbol: Symbol,
    pub reason: String,
}

/// Result of folding every outcome into one table.
#[derive(Debug, Clone)]
pub struct TableBuild {
    pub table: ConsolidatedTable,
    /// Row count per included symbol, in table order.
    pub included: Vec<(Symbol, usize)>,
    pub skipped: Vec<SkippedSymbol>,
}

/// Folds per-symbol outcomes into one table.
///
/// Outcomes may arrive in any order; the finished table is always sorted by
/// symbol, then date.
#[derive(Debug, Default)]
pub struct TableBuilder {
    parsed: BTreeMap<Symbol, Vec<QuoteRecord>>,
    skipped: BTreeMap<Symbol, String>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome: SymbolOutcome) {
        match outcome {
            SymbolOutcome::Parsed { symbol, records } => {
                self.skipped.remove(&symbol);
                self.parsed.insert(symbol, records);
            }
            SymbolOutcome::Skipped { symbol, reason } => {
                self.parsed.remove(&symbol);
                self.skipped.insert(symbol, reason);
            }
        }
    }

    pub fn finish(self) -> TableBuild {
        let total: usize = self.parsed.values().map(Vec::len).sum();
        let mut rows = Vec::with_capacity(total);
        let mut included = Vec::with_capacity(self.parsed.len());

        for (symbol, mut records) in self.parsed {
            records.sort_by_key(|r| r.date);
            included.push((symbol, records.len()));
            rows.extend(records);
        }

        let skipped = self
            .skipped
            .into_iter()
            .map(|(symbol, reason)| SkippedSymbol { symbol, reason })
            .collect();

        TableBuild {
            table: ConsolidatedTable { rows },
            included,
            skipped,
        }
    }
}

impl Extend<SymbolOutcome> for TableBuilder {
    fn extend<I: IntoIterator<Item = SymbolOutcome>>(&mut self, iter: I) {
        for outcome in iter {
            self.push(outcome);
        }
    }
}

/// The union of all parsed symbols under the fixed quote schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedTable {
    rows: Vec<QuoteRecord>,
}

impl ConsolidatedTable {
    pub fn rows(&self) -> &[QuoteRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct symbols, in table order.
    pub fn symbols(&self) -> Vec<&Symbol> {
        let mut out: Vec<&Symbol> = Vec::new();
        for r in &self.rows {
            if out.last() != Some(&&r.symbol) {
                out.push(&r.symbol);
            }
        }
        out
    }

    /// Columnar form of the table. `format` names the target in errors.
    pub fn to_dataframe(&self, format: TableFormat) -> Result<DataFrame, TableError> {
        let encode_err = |e: PolarsError| TableError::Encode {
            format,
            reason: e.to_string(),
        };

        let symbols: Vec<&str> = self.rows.iter().map(|r| r.symbol.as_str()).collect();
        let dates: Vec<i32> = self.rows.iter().map(|r| days_since_epoch(r.date)).collect();
        let opens: Vec<Option<f64>> = self.rows.iter().map(|r| r.open).collect();
        let highs: Vec<Option<f64>> = self.rows.iter().map(|r| r.high).collect();
        let lows: Vec<Option<f64>> = self.rows.iter().map(|r| r.low).collect();
        let closes: Vec<Option<f64>> = self.rows.iter().map(|r| r.close).collect();
        let adj_closes: Vec<Option<f64>> = self.rows.iter().map(|r| r.adj_close).collect();
        let volumes: Vec<Option<u64>> = self.rows.iter().map(|r| r.volume).collect();

        DataFrame::new(vec![
            Column::new("symbol".into(), symbols),
            Column::new("date".into(), dates)
                .cast(&DataType::Date)
                .map_err(encode_err)?,
            Column::new("open".into(), opens),
            Column::new("high".into(), highs),
            Column::new("low".into(), lows),
            Column::new("close".into(), closes),
            Column::new("adj_close".into(), adj_closes),
            Column::new("volume".into(), volumes),
        ])
        .map_err(encode_err)
    }

    pub fn from_dataframe(df: &DataFrame, format: TableFormat) -> Result<Self, TableError> {
        QuoteSchema::validate(df)?;

        let decode_err = |e: PolarsError| TableError::Decode {
            format,
            reason: e.to_string(),
        };

        let symbol_ca = df.column("symbol").and_then(|c| c.str()).map_err(decode_err)?;
        let date_ca = df.column("date").and_then(|c| c.date()).map_err(decode_err)?;
        let open_ca = df.column("open").and_then(|c| c.f64()).map_err(decode_err)?;
        let high_ca = df.column("high").and_then(|c| c.f64()).map_err(decode_err)?;
        let low_ca = df.column("low").and_then(|c| c.f64()).map_err(decode_err)?;
        let close_ca = df.column("close").and_then(|c| c.f64()).map_err(decode_err)?;
        let adj_ca = df.column("adj_close").and_then(|c| c.f64()).map_err(decode_err)?;
        let vol_ca = df.column("volume").and_then(|c| c.u64()).map_err(decode_err)?;

        let mut rows = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            let raw_symbol = symbol_ca.get(i).ok_or_else(|| TableError::InvalidRow {
                row: i,
                reason: "null symbol".into(),
            })?;
            let symbol = Symbol::parse(raw_symbol).map_err(|e| TableError::InvalidRow {
                row: i,
                reason: e.to_string(),
            })?;
            let days = date_ca.get(i).ok_or_else(|| TableError::InvalidRow {
                row: i,
                reason: "null date".into(),
            })?;
            let date = date_from_days(days).ok_or_else(|| TableError::InvalidRow {
                row: i,
                reason: format!("date out of range: {days}"),
            })?;

            rows.push(QuoteRecord {
                symbol,
                date,
                open: open_ca.get(i),
                high: high_ca.get(i),
                low: low_ca.get(i),
                close: close_ca.get(i),
                adj_close: adj_ca.get(i),
                volume: vol_ca.get(i),
            });
        }

        Ok(Self { rows })
    }

    /// Atomically write the table to `path`.
    ///
    /// Returns the number of bytes written. Nothing appears at `path` unless
    /// the whole encoding succeeded.
    pub fn write(&self, path: &Path, format: TableFormat) -> Result<u64, TableError> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| io_err(&parent, e))?;

        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("table");
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{stem}."))
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| io_err(&parent, e))?;

        let encode_err = |reason: String| TableError::Encode { format, reason };

        match format {
            TableFormat::Parquet => {
                let mut df = self.to_dataframe(format)?;
                ParquetWriter::new(tmp.as_file_mut())
                    .with_compression(ParquetCompression::Zstd(None))
                    .finish(&mut df)
                    .map_err(|e| encode_err(e.to_string()))?;
            }
            TableFormat::Feather => {
                let mut df = self.to_dataframe(format)?;
                IpcWriter::new(tmp.as_file_mut())
                    .with_compression(Some(IpcCompression::ZSTD))
                    .finish(&mut df)
                    .map_err(|e| encode_err(e.to_string()))?;
            }
            TableFormat::Csv => {
                // Header is written explicitly so an empty table still has one.
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(tmp.as_file_mut());
                writer
                    .write_record(QuoteSchema::COLUMNS)
                    .map_err(|e| encode_err(e.to_string()))?;
                for record in &self.rows {
                    writer
                        .serialize(record)
                        .map_err(|e| encode_err(e.to_string()))?;
                }
                writer.flush().map_err(|e| encode_err(e.to_string()))?;
            }
        }

        let tmp_path = tmp.path().to_path_buf();
        tmp.as_file_mut()
            .flush()
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| io_err(&tmp_path, e))?;
        let bytes = tmp
            .as_file()
            .metadata()
            .map(|m| m.len())
            .map_err(|e| io_err(&tmp_path, e))?;

        tmp.persist(path).map_err(|e| io_err(path, e.error))?;

        info!(
            path = %path.display(),
            %format,
            rows = self.rows.len(),
            bytes,
            "wrote consolidated table"
        );
        Ok(bytes)
    }

    /// Read a table previously written by [`ConsolidatedTable::write`].
    pub fn read(path: &Path, format: TableFormat) -> Result<Self, TableError> {
        let file = fs::File::open(path).map_err(|e| io_err(path, e))?;
        let decode_err = |reason: String| TableError::Decode { format, reason };
        debug!(path = %path.display(), %format, "reading consolidated table");

        match format {
            TableFormat::Parquet => {
                let df = ParquetReader::new(file)
                    .finish()
                    .map_err(|e| decode_err(e.to_string()))?;
                Self::from_dataframe(&df, format)
            }
            TableFormat::Feather => {
                let df = IpcReader::new(file)
                    .finish()
                    .map_err(|e| decode_err(e.to_string()))?;
                Self::from_dataframe(&df, format)
            }
            TableFormat::Csv => {
                let mut reader = csv::Reader::from_reader(std::io::BufReader::new(file));
                let mut rows = Vec::new();
                for (i, result) in reader.deserialize::<QuoteRecord>().enumerate() {
                    let record = result.map_err(|e| TableError::InvalidRow {
                        row: i,
                        reason: e.to_string(),
                    })?;
                    rows.push(record);
                }
                Ok(Self { rows })
            }
        }
    }
}

impl From<Vec<QuoteRecord>> for ConsolidatedTable {
    /// Wrap rows as-is. Callers are responsible for ordering.
    fn from(rows: Vec<QuoteRecord>) -> Self {
        Self { rows }
    }
}

fn io_err(path: &Path, e: std::io::Error) -> TableError {
    TableError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn days_since_epoch(date: NaiveDate) -> i32 {
    use chrono::Datelike;
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}
