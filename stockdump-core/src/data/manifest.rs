//! Request manifest: JSONL append-only log of authenticated fetch requests.
//!
//! One `ManifestEntry` per line. New invocations only ever append; an entry
//! for a symbol that was already requested on the same UTC day is not written
//! again. Each line is serialized in full before it is written and the file is
//! flushed per line, so a crash can at worst leave one torn trailing line,
//! which readers detect and skip.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{Secret, Symbol, SymbolError};

/// Environment variable consulted when no crumb is passed explicitly.
pub const CRUMB_ENV: &str = "YAHOO_CRUMB";
/// Environment variable consulted when no cookie is passed explicitly.
pub const COOKIE_ENV: &str = "YAHOO_COOKIE";

const CRUMB_PLACEHOLDERS: &[&str] = &[
    "YOUR_CRUMB",
    "YOUR_CRUMB_VALUE",
    "<YOUR_CRUMB>",
    "YOUR_CRUMB_HERE",
];
const COOKIE_PLACEHOLDERS: &[&str] = &["YOUR_COOKIE", "<YOUR_COOKIE>", "YOUR_COOKIE_HERE", "B=..."];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("missing {which}: pass --{which} or set {env}")]
    AuthMissing {
        which: &'static str,
        env: &'static str,
    },

    #[error("{which} looks like a placeholder; copy the real value from a browser session")]
    AuthPlaceholder { which: &'static str },

    #[error("no symbols given")]
    NoSymbols,

    #[error("invalid symbol: {0}")]
    InvalidSymbol(#[from] SymbolError),

    #[error("invalid request window: start {start} is after end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("manifest {path} unreadable: {reason}")]
    ManifestUnreadable { path: PathBuf, reason: String },

    #[error("manifest corrupt at line {line}: {reason}")]
    ManifestCorrupt { line: usize, reason: String },

    #[error("failed to write manifest {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },
}

/// Crumb + cookie pair required by every request.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub crumb: Secret,
    pub cookie: Secret,
}

impl Credentials {
    /// Resolve credentials from explicit values, falling back to the process
    /// environment.
    pub fn resolve(crumb: Option<String>, cookie: Option<String>) -> Result<Self, ManifestError> {
        Self::resolve_with(crumb, cookie, |key| std::env::var(key).ok())
    }

    /// Resolve credentials with a custom environment lookup.
    pub fn resolve_with<F>(
        crumb: Option<String>,
        cookie: Option<String>,
        lookup: F,
    ) -> Result<Self, ManifestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let crumb = non_blank(crumb)
            .or_else(|| non_blank(lookup(CRUMB_ENV)))
            .ok_or(ManifestError::AuthMissing {
                which: "crumb",
                env: CRUMB_ENV,
            })?;
        let cookie = non_blank(cookie)
            .or_else(|| non_blank(lookup(COOKIE_ENV)))
            .ok_or(ManifestError::AuthMissing {
                which: "cookie",
                env: COOKIE_ENV,
            })?;

        let crumb = crumb.trim().to_string();
        let cookie = cookie.trim().to_string();

        if CRUMB_PLACEHOLDERS.contains(&crumb.to_ascii_uppercase().as_str()) {
            return Err(ManifestError::AuthPlaceholder { which: "crumb" });
        }
        if cookie.contains("...")
            || COOKIE_PLACEHOLDERS.contains(&cookie.to_ascii_uppercase().as_str())
        {
            return Err(ManifestError::AuthPlaceholder { which: "cookie" });
        }

        Ok(Self {
            crumb: Secret::new(crumb),
            cookie: Secret::new(cookie),
        })
    }
}

/// Bar interval accepted by the chart endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Interval {
    #[default]
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "1wk")]
    Weekly,
    #[serde(rename = "1mo")]
    Monthly,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Daily => "1d",
            Interval::Weekly => "1wk",
            Interval::Monthly => "1mo",
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1d" => Ok(Interval::Daily),
            "1wk" => Ok(Interval::Weekly),
            "1mo" => Ok(Interval::Monthly),
            other => Err(format!("unknown interval '{other}' (valid: 1d, 1wk, 1mo)")),
        }
    }
}

/// Date range and bar size for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval: Interval,
}

impl FetchWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, interval: Interval) -> Result<Self, ManifestError> {
        if start > end {
            return Err(ManifestError::InvalidWindow { start, end });
        }
        Ok(Self {
            start,
            end,
            interval,
        })
    }

    /// Daily bars for the year ending on `today`.
    pub fn trailing_year(today: NaiveDate) -> Self {
        Self {
            start: today - Duration::days(365),
            end: today,
            interval: Interval::Daily,
        }
    }
}

/// One line of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub symbol: Symbol,
    pub crumb: Secret,
    pub cookie: Secret,
    pub requested_at: DateTime<Utc>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub interval: Interval,
}

impl ManifestEntry {
    /// Dedup key: one request per symbol per UTC day.
    fn day_key(&self) -> (Symbol, NaiveDate) {
        (self.symbol.clone(), self.requested_at.date_naive())
    }
}

/// Outcome of one builder invocation.
#[derive(Debug, Clone)]
pub struct AppendReport {
    pub path: PathBuf,
    pub written: Vec<Symbol>,
    pub already_present: Vec<Symbol>,
}

/// Normalize raw tickers: trim, uppercase, collapse duplicates (first
/// occurrence keeps its position).
pub fn normalize_symbols<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Symbol>, ManifestError> {
    if raw.is_empty() {
        return Err(ManifestError::NoSymbols);
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for r in raw {
        let sym = Symbol::parse(r.as_ref())?;
        if seen.insert(sym.clone()) {
            out.push(sym);
        }
    }
    Ok(out)
}

/// Handle to a manifest file on disk.
pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build or extend the manifest with one entry per symbol.
    ///
    /// All validation happens before the first filesystem call: with invalid
    /// symbols or a bad window nothing is created or written.
    pub fn append<S: AsRef<str>>(
        &self,
        symbols: &[S],
        credentials: &Credentials,
        window: FetchWindow,
        now: DateTime<Utc>,
    ) -> Result<AppendReport, ManifestError> {
        let symbols = normalize_symbols(symbols)?;
        let window = FetchWindow::new(window.start, window.end, window.interval)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.write_failed(e))?;
        }

        let existing: HashSet<(Symbol, NaiveDate)> = match self.read_all() {
            Ok(entries) => entries.iter().map(ManifestEntry::day_key).collect(),
            Err(ManifestError::ManifestUnreadable { .. }) if !self.path.exists() => HashSet::new(),
            Err(e) => return Err(e),
        };

        let today = now.date_naive();
        let mut written = Vec::new();
        let mut already_present = Vec::new();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.write_failed(e))?;

        match repair_tail(&mut file).map_err(|e| self.write_failed(e))? {
            TailRepair::Clean => {}
            TailRepair::Terminated => {
                debug!(path = %self.path.display(), "terminated trailing manifest line");
            }
            TailRepair::Discarded => {
                warn!(path = %self.path.display(), "discarded torn trailing manifest line");
            }
        }

        for symbol in symbols {
            if existing.contains(&(symbol.clone(), today)) {
                already_present.push(symbol);
                continue;
            }

            let entry = ManifestEntry {
                symbol: symbol.clone(),
                crumb: credentials.crumb.clone(),
                cookie: credentials.cookie.clone(),
                requested_at: now,
                start: window.start,
                end: window.end,
                interval: window.interval,
            };

            let mut line = serde_json::to_string(&entry).map_err(|e| ManifestError::WriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
            line.push('\n');

            file.write_all(line.as_bytes())
                .map_err(|e| self.write_failed(e))?;
            file.flush().map_err(|e| self.write_failed(e))?;
            written.push(symbol);
        }

        file.sync_data().map_err(|e| self.write_failed(e))?;

        info!(
            path = %self.path.display(),
            written = written.len(),
            skipped = already_present.len(),
            "manifest updated"
        );

        Ok(AppendReport {
            path: self.path.clone(),
            written,
            already_present,
        })
    }

    /// Read every entry in file order.
    ///
    /// A final line without a trailing newline that fails to parse is a torn
    /// write and is skipped with a warning. Any other malformed line is
    /// `ManifestCorrupt`.
    pub fn read_all(&self) -> Result<Vec<ManifestEntry>, ManifestError> {
        let file = fs::File::open(&self.path).map_err(|e| ManifestError::ManifestUnreadable {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let mut reader = io::BufReader::new(file);
        let mut entries = Vec::new();
        let mut line_no = 0usize;
        let mut buf = String::new();

        loop {
            buf.clear();
            let n = reader
                .read_line(&mut buf)
                .map_err(|e| ManifestError::ManifestUnreadable {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })?;
            if n == 0 {
                break;
            }
            line_no += 1;

            let terminated = buf.ends_with('\n');
            let line = buf.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<ManifestEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if !terminated => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no,
                        error = %e,
                        "skipping torn trailing manifest line"
                    );
                }
                Err(e) => {
                    return Err(ManifestError::ManifestCorrupt {
                        line: line_no,
                        reason: e.to_string(),
                    })
                }
            }
        }

        Ok(entries)
    }

    fn write_failed(&self, e: io::Error) -> ManifestError {
        ManifestError::WriteFailed {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

/// What `repair_tail` did to the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailRepair {
    /// Empty file, or the last line already ends in a newline.
    Clean,
    /// The last line was whole but unterminated; a newline was added.
    Terminated,
    /// The last line did not parse and was cut off.
    Discarded,
}

/// Make the file end on a line boundary before appending.
///
/// Uses the same rule as `read_all`: an unterminated last line is kept if it
/// parses as an entry and dropped otherwise. The file must be opened in
/// append mode.
fn repair_tail(file: &mut fs::File) -> io::Result<TailRepair> {
    let len = file.metadata()?.len();
    let start = last_line_start(file, len)?;
    if start == len {
        return Ok(TailRepair::Clean);
    }

    let mut tail = Vec::with_capacity((len - start) as usize);
    file.seek(SeekFrom::Start(start))?;
    file.read_to_end(&mut tail)?;

    let text = String::from_utf8_lossy(&tail);
    let line = text.trim();
    if line.is_empty() || serde_json::from_str::<ManifestEntry>(line).is_ok() {
        file.write_all(b"\n")?;
        return Ok(TailRepair::Terminated);
    }

    file.set_len(start)?;
    Ok(TailRepair::Discarded)
}

/// Offset just past the last newline, or 0 when there is none.
fn last_line_start(file: &mut fs::File, len: u64) -> io::Result<u64> {
    const CHUNK: u64 = 4096;

    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];

    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..n])?;

        if let Some(pos) = buf[..n].iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}
