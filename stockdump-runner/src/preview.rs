//! Preview Utility: render a bounded prefix of one dump.
//!
//! Raw mode streams decompression and stops at the row or byte limit, so an
//! arbitrarily large dump is never fully materialized. Parsed mode has to
//! decode the whole payload to parse it, and refuses payloads above a fixed
//! cap instead.

use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use stockdump_core::data::store::{open_dump, read_payload};
use stockdump_core::data::{parse_payload, DumpFormat, ParseError, StoreError};
use stockdump_core::domain::{QuoteRecord, Symbol};
use thiserror::Error;

pub const DEFAULT_ROWS: usize = 5;
/// Byte cap for raw previews when none is given. Chart JSON is one long line.
pub const DEFAULT_RAW_BYTES: u64 = 64 * 1024;
/// Largest decompressed payload parsed mode will load.
pub const MAX_PARSED_PAYLOAD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to parse {symbol}: {source}")]
    Parse {
        symbol: String,
        #[source]
        source: ParseError,
    },
}

/// Decoded prefix of a dump.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPreview {
    pub text: String,
    pub lines: usize,
    pub bytes: u64,
    /// More data follows the shown prefix.
    pub truncated: bool,
}

/// First rows of a parsed dump.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPreview {
    pub records: Vec<QuoteRecord>,
    /// Rows in the whole payload.
    pub total_rows: usize,
}

fn label_for(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dump")
        .to_string()
}

/// Stream up to `rows` lines (and at most `max_bytes` bytes) of a dump.
pub fn preview_raw(
    path: &Path,
    rows: usize,
    max_bytes: Option<u64>,
) -> Result<RawPreview, PreviewError> {
    let label = label_for(path);
    let corrupt = |e: std::io::Error| StoreError::CorruptDump {
        symbol: label.clone(),
        reason: format!("decompress: {e}"),
    };

    let decoder = open_dump(path, &label)?;
    let cap = max_bytes.unwrap_or(DEFAULT_RAW_BYTES);
    let mut reader = BufReader::new(decoder.take(cap));

    let mut out = Vec::new();
    let mut lines = 0;
    while lines < rows {
        let n = reader.read_until(b'\n', &mut out).map_err(corrupt)?;
        if n == 0 {
            break;
        }
        lines += 1;
    }

    let truncated = if !reader.fill_buf().map_err(corrupt)?.is_empty() {
        true
    } else {
        // Nothing buffered: either the end of the payload or the byte cap.
        let take = reader.into_inner();
        if take.limit() > 0 {
            false
        } else {
            let mut inner = take.into_inner();
            let mut probe = [0u8; 1];
            inner.read(&mut probe).map_err(corrupt)? > 0
        }
    };

    Ok(RawPreview {
        bytes: out.len() as u64,
        text: String::from_utf8_lossy(&out).into_owned(),
        lines,
        truncated,
    })
}

/// Decode and parse a dump, keeping the first `rows` records.
pub fn preview_parsed(
    path: &Path,
    rows: usize,
    hint: Option<DumpFormat>,
) -> Result<ParsedPreview, PreviewError> {
    let label = label_for(path);
    let payload = read_payload(path, &label, Some(MAX_PARSED_PAYLOAD))?;
    let symbol = Symbol::parse(&label).map_err(|e| StoreError::CorruptDump {
        symbol: label.clone(),
        reason: format!("file name is not a symbol: {e}"),
    })?;
    let mut records = parse_payload(&symbol, &payload, hint).map_err(|source| {
        PreviewError::Parse {
            symbol: label.clone(),
            source,
        }
    })?;
    let total_rows = records.len();
    records.truncate(rows);
    Ok(ParsedPreview {
        records,
        total_rows,
    })
}

fn cell<T: ToString>(v: Option<T>) -> String {
    v.map_or_else(|| "-".to_string(), |x| x.to_string())
}

/// Fixed-width table of quote records.
pub fn render_records(records: &[QuoteRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<10} {:>12} {:>12} {:>12} {:>12} {:>12} {:>14}",
        "symbol", "date", "open", "high", "low", "close", "adj_close", "volume"
    );
    for r in records {
        let _ = writeln!(
            out,
            "{:<10} {:<10} {:>12} {:>12} {:>12} {:>12} {:>12} {:>14}",
            r.symbol.as_str(),
            r.date.to_string(),
            cell(r.open),
            cell(r.high),
            cell(r.low),
            cell(r.close),
            cell(r.adj_close),
            cell(r.volume),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockdump_core::data::DumpStore;
    use tempfile::TempDir;

    const CSV: &str = "Date,Open,High,Low,Close,Adj Close,Volume\n\
                       2024-01-02,10,11,9,10.5,10.5,100\n\
                       2024-01-03,10.5,12,10,11.5,11.5,null\n\
                       2024-01-04,11.5,12,11,11.8,11.8,300\n";

    fn store_with(symbol: &str, body: &[u8]) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let store = DumpStore::new(dir.path());
        let sym = Symbol::parse(symbol).unwrap();
        store.write_dump(&sym, body, 3).unwrap();
        let path = store.path_for(&sym);
        (dir, path)
    }

    #[test]
    fn raw_preview_stops_at_row_limit() {
        let (_dir, path) = store_with("SPY", CSV.as_bytes());
        let p = preview_raw(&path, 2, None).unwrap();
        assert_eq!(p.lines, 2);
        assert!(p.text.starts_with("Date,Open"));
        assert!(p.text.ends_with("10.5,100\n"));
        assert!(p.truncated);
    }

    #[test]
    fn raw_preview_stops_at_byte_limit() {
        let (_dir, path) = store_with("SPY", CSV.as_bytes());
        let p = preview_raw(&path, 100, Some(10)).unwrap();
        assert_eq!(p.bytes, 10);
        assert_eq!(p.text, "Date,Open,");
        assert!(p.truncated);
    }

    #[test]
    fn raw_preview_of_small_dump_is_complete() {
        let (_dir, path) = store_with("SPY", CSV.as_bytes());
        let p = preview_raw(&path, 100, None).unwrap();
        assert_eq!(p.lines, 4);
        assert_eq!(p.text, CSV);
        assert!(!p.truncated);
    }

    #[test]
    fn raw_preview_of_zero_byte_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("SPY.zst");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            preview_raw(&path, 5, None),
            Err(PreviewError::Store(StoreError::CorruptDump { .. }))
        ));
    }

    #[test]
    fn parsed_preview_keeps_first_rows_and_nulls() {
        let (_dir, path) = store_with("SPY", CSV.as_bytes());
        let p = preview_parsed(&path, 2, None).unwrap();
        assert_eq!(p.total_rows, 3);
        assert_eq!(p.records.len(), 2);
        assert_eq!(p.records[1].volume, None);

        let table = render_records(&p.records);
        assert_eq!(table.lines().count(), 3);
        assert!(table.contains("2024-01-03"));
    }

    #[test]
    fn parsed_preview_reports_parse_failure() {
        let (_dir, path) = store_with("SPY", b"{\"chart\":");
        assert!(matches!(
            preview_parsed(&path, 5, None),
            Err(PreviewError::Parse { .. })
        ));
    }
}
