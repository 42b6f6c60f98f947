//! Dump store: one zstd-compressed provider payload per symbol.
//!
//! Layout: `{root}/{SYMBOL}.zst`
//!
//! - Atomic writes: compress into a dot-prefixed temp file in the same
//!   directory, fsync, then rename into place. Readers never observe a
//!   half-written dump. A failed write removes its temp file; temp files of a
//!   killed process are swept by the next `ensure_root`.
//! - Last write wins: a re-fetch replaces the previous dump for the symbol.
//! - Missing or zero-byte dumps read as `CorruptDump`, scoped to one symbol.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::Symbol;

/// File extension for dumps.
pub const DUMP_EXTENSION: &str = "zst";

/// Default zstd level.
pub const DEFAULT_LEVEL: i32 = 3;

/// Streaming decoder over one dump.
pub type DumpReader = zstd::stream::read::Decoder<'static, BufReader<fs::File>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt dump for {symbol}: {reason}")]
    CorruptDump { symbol: String, reason: String },

    #[error("failed to write {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("dump directory {path} is not usable: {reason}")]
    RootUnusable { path: PathBuf, reason: String },

    #[error("payload for {symbol} exceeds {limit} bytes")]
    TooLarge { symbol: String, limit: u64 },
}

/// A dump present in the store.
#[derive(Debug, Clone)]
pub struct DumpFile {
    pub symbol: Symbol,
    pub path: PathBuf,
    pub compressed_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Result of committing a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpInfo {
    pub path: PathBuf,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
}

/// Directory of per-symbol dumps.
#[derive(Debug, Clone)]
pub struct DumpStore {
    root: PathBuf,
}

impl DumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of the dump for `symbol`.
    pub fn path_for(&self, symbol: &Symbol) -> PathBuf {
        self.root.join(format!("{symbol}.{DUMP_EXTENSION}"))
    }

    /// Create the store directory if needed and clear out temp files left by
    /// a writer that was killed before it could rename or unlink them.
    ///
    /// Must only be called by the store's single writer before it starts
    /// writing.
    pub fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|e| StoreError::RootUnusable {
            path: self.root.clone(),
            reason: e.to_string(),
        })?;
        self.sweep_stale_temps();
        Ok(())
    }

    /// Best effort: failures are logged and otherwise ignored.
    fn sweep_stale_temps(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !(name.starts_with('.') && name.ends_with(".tmp")) {
                continue;
            }
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %entry.path().display(), error = %e, "failed to remove stale temp file"),
            }
        }
        if removed > 0 {
            debug!(root = %self.root.display(), removed, "swept stale temp files");
        }
    }

    /// Compress `body` and commit it as the dump for `symbol`.
    ///
    /// The temp file is removed automatically if anything fails before the
    /// rename, so a failed write never disturbs a previously committed dump.
    pub fn write_dump(
        &self,
        symbol: &Symbol,
        mut body: impl Read,
        level: i32,
    ) -> Result<DumpInfo, StoreError> {
        let path = self.path_for(symbol);
        let write_failed = |reason: String| StoreError::WriteFailed {
            path: path.clone(),
            reason,
        };

        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{symbol}."))
            .suffix(".tmp")
            .tempfile_in(&self.root)
            .map_err(|e| write_failed(format!("create temp file: {e}")))?;

        let raw_bytes = {
            let writer = BufWriter::new(tmp.as_file());
            let mut encoder = zstd::stream::write::Encoder::new(writer, level)
                .map_err(|e| write_failed(format!("init encoder: {e}")))?;
            let n = io::copy(&mut body, &mut encoder)
                .map_err(|e| write_failed(format!("compress: {e}")))?;
            let mut writer = encoder
                .finish()
                .map_err(|e| write_failed(format!("finish frame: {e}")))?;
            writer
                .flush()
                .map_err(|e| write_failed(format!("flush: {e}")))?;
            n
        };

        tmp.as_file()
            .sync_all()
            .map_err(|e| write_failed(format!("fsync: {e}")))?;
        let compressed_bytes = tmp
            .as_file()
            .metadata()
            .map(|m| m.len())
            .map_err(|e| write_failed(format!("stat: {e}")))?;

        tmp.persist(&path)
            .map_err(|e| write_failed(format!("atomic rename: {}", e.error)))?;

        debug!(%symbol, raw_bytes, compressed_bytes, path = %path.display(), "dump committed");

        Ok(DumpInfo {
            path,
            raw_bytes,
            compressed_bytes,
        })
    }

    /// Enumerate dumps. Order is whatever the filesystem returns.
    ///
    /// Temp files and anything that does not look like `{SYMBOL}.zst` are
    /// ignored.
    pub fn list(&self) -> Result<Vec<DumpFile>, StoreError> {
        let unusable = |e: io::Error| StoreError::RootUnusable {
            path: self.root.clone(),
            reason: e.to_string(),
        };

        let mut dumps = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(unusable)? {
            let entry = entry.map_err(unusable)?;
            let path = entry.path();

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(DUMP_EXTENSION) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let symbol = match Symbol::parse(stem) {
                Ok(s) => s,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "ignoring dump with invalid symbol name");
                    continue;
                }
            };
            // `aapl.zst` would otherwise shadow or duplicate `AAPL.zst`.
            if symbol.as_str() != stem {
                warn!(file = %path.display(), %symbol, "ignoring dump whose name is not canonical");
                continue;
            }

            dumps.push(DumpFile {
                symbol,
                path,
                compressed_bytes: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        Ok(dumps)
    }

    /// Open the dump for `symbol` for streaming decompression.
    pub fn open(&self, symbol: &Symbol) -> Result<DumpReader, StoreError> {
        open_dump(&self.path_for(symbol), symbol.as_str())
    }

    /// Decompress a whole dump into memory, refusing payloads above `limit`.
    pub fn read_payload(&self, symbol: &Symbol, limit: Option<u64>) -> Result<Vec<u8>, StoreError> {
        read_payload(&self.path_for(symbol), symbol.as_str(), limit)
    }
}

/// Open any dump file for streaming decompression.
pub fn open_dump(path: &Path, label: &str) -> Result<DumpReader, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptDump {
        symbol: label.to_string(),
        reason,
    };

    let meta = fs::metadata(path).map_err(|e| corrupt(format!("{}: {e}", path.display())))?;
    if meta.len() == 0 {
        return Err(corrupt(format!("{} is empty", path.display())));
    }
    let file = fs::File::open(path).map_err(|e| corrupt(format!("{}: {e}", path.display())))?;
    zstd::stream::read::Decoder::new(file).map_err(|e| corrupt(format!("decoder: {e}")))
}

/// Decompress a dump file fully, failing with `TooLarge` past `limit` bytes.
pub fn read_payload(path: &Path, label: &str, limit: Option<u64>) -> Result<Vec<u8>, StoreError> {
    let decoder = open_dump(path, label)?;
    let mut out = Vec::new();

    let result = match limit {
        Some(limit) => decoder.take(limit + 1).read_to_end(&mut out),
        None => {
            let mut decoder = decoder;
            decoder.read_to_end(&mut out)
        }
    };
    result.map_err(|e| StoreError::CorruptDump {
        symbol: label.to_string(),
        reason: format!("decompress: {e}"),
    })?;

    if let Some(limit) = limit {
        if out.len() as u64 > limit {
            return Err(StoreError::TooLarge {
                symbol: label.to_string(),
                limit,
            });
        }
    }
    if out.is_empty() {
        return Err(StoreError::CorruptDump {
            symbol: label.to_string(),
            reason: "empty payload".into(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    fn store() -> (TempDir, DumpStore) {
        let tmp = TempDir::new().unwrap();
        let store = DumpStore::new(tmp.path().join("raw"));
        store.ensure_root().unwrap();
        (tmp, store)
    }

    #[test]
    fn write_and_read_roundtrip() {
        let (_tmp, store) = store();
        let body = b"Date,Open\n2024-01-02,1.0\n".repeat(50);

        let info = store.write_dump(&sym("AAPL"), &body[..], DEFAULT_LEVEL).unwrap();
        assert_eq!(info.path, store.root().join("AAPL.zst"));
        assert_eq!(info.raw_bytes, body.len() as u64);
        assert!(info.compressed_bytes < info.raw_bytes);

        let back = store.read_payload(&sym("AAPL"), None).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn rewrite_replaces_previous_dump() {
        let (_tmp, store) = store();
        store.write_dump(&sym("SPY"), &b"old"[..], 3).unwrap();
        store.write_dump(&sym("SPY"), &b"new payload"[..], 3).unwrap();

        assert_eq!(store.read_payload(&sym("SPY"), None).unwrap(), b"new payload");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (_tmp, store) = store();
        store.write_dump(&sym("SPY"), &b"x"[..], 3).unwrap();
        let names: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["SPY.zst".to_string()]);
    }

    #[test]
    fn list_skips_temp_and_foreign_files() {
        let (_tmp, store) = store();
        store.write_dump(&sym("MSFT"), &b"x"[..], 3).unwrap();
        fs::write(store.root().join(".AAPL.abc.tmp"), b"partial").unwrap();
        fs::write(store.root().join("notes.txt"), b"hi").unwrap();
        fs::create_dir(store.root().join("sub.zst")).unwrap();

        let dumps = store.list().unwrap();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].symbol.as_str(), "MSFT");
        assert!(dumps[0].compressed_bytes > 0);
    }

    #[test]
    fn list_ignores_non_canonical_names() {
        let (_tmp, store) = store();
        store.write_dump(&sym("AAPL"), &b"x"[..], 3).unwrap();
        fs::write(store.root().join("aapl.zst"), b"stray").unwrap();

        let dumps = store.list().unwrap();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].path, store.root().join("AAPL.zst"));
    }

    #[test]
    fn ensure_root_sweeps_abandoned_temp_files() {
        let (_tmp, store) = store();
        store.write_dump(&sym("SPY"), &b"x"[..], 3).unwrap();
        fs::write(store.root().join(".QQQ.a1b2c3.tmp"), b"partial").unwrap();
        fs::write(store.root().join("notes.tmp"), b"keep").unwrap();

        store.ensure_root().unwrap();

        let mut names: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["SPY.zst".to_string(), "notes.tmp".to_string()]);
    }

    #[test]
    fn missing_dump_is_corrupt() {
        let (_tmp, store) = store();
        let err = store.open(&sym("NOPE")).err().unwrap();
        assert!(matches!(err, StoreError::CorruptDump { .. }));
    }

    #[test]
    fn zero_byte_dump_is_corrupt() {
        let (_tmp, store) = store();
        fs::write(store.root().join("ZERO.zst"), b"").unwrap();
        let err = store.read_payload(&sym("ZERO"), None).unwrap_err();
        assert!(matches!(err, StoreError::CorruptDump { .. }));
    }

    #[test]
    fn truncated_frame_is_corrupt() {
        let (_tmp, store) = store();
        let body = b"0123456789".repeat(1000);
        let info = store.write_dump(&sym("TRNC"), &body[..], 3).unwrap();
        let bytes = fs::read(&info.path).unwrap();
        fs::write(&info.path, &bytes[..bytes.len() / 2]).unwrap();

        let err = store.read_payload(&sym("TRNC"), None).unwrap_err();
        assert!(matches!(err, StoreError::CorruptDump { .. }));
    }

    #[test]
    fn payload_limit_is_enforced() {
        let (_tmp, store) = store();
        store.write_dump(&sym("BIG"), &[b'a'; 100][..], 3).unwrap();
        assert!(matches!(
            store.read_payload(&sym("BIG"), Some(10)),
            Err(StoreError::TooLarge { limit: 10, .. })
        ));
        assert_eq!(store.read_payload(&sym("BIG"), Some(100)).unwrap().len(), 100);
    }

    #[test]
    fn list_on_missing_root_fails() {
        let tmp = TempDir::new().unwrap();
        let store = DumpStore::new(tmp.path().join("absent"));
        assert!(matches!(store.list(), Err(StoreError::RootUnusable { .. })));
    }
}
