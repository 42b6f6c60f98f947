//! Shared fixtures for runner integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{NaiveDate, TimeZone, Utc};
use stockdump_core::data::{FetchError, Interval, ManifestEntry, QuoteProvider, RawPayload};
use stockdump_core::domain::{Secret, Symbol};

/// Yahoo history CSV for `symbol` with a price level derived from its name.
pub fn history_csv(symbol: &str) -> String {
    let base = symbol.bytes().map(u32::from).sum::<u32>() as f64;
    let mut out = String::from("Date,Open,High,Low,Close,Adj Close,Volume\n");
    for (i, day) in ["2024-01-02", "2024-01-03", "2024-01-04"].iter().enumerate() {
        let px = base + i as f64;
        out.push_str(&format!(
            "{day},{px},{},{},{},{},{}\n",
            px + 1.0,
            px - 1.0,
            px + 0.5,
            px + 0.5,
            1000 * (i + 1)
        ));
    }
    out
}

pub fn entry(symbol: &str) -> ManifestEntry {
    ManifestEntry {
        symbol: Symbol::parse(symbol).unwrap(),
        crumb: Secret::new("crumbCRUMB"),
        cookie: Secret::new("A3=d=AQAB"),
        requested_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        interval: Interval::Daily,
    }
}

/// Provider double: per-symbol scripted failures, then success.
///
/// Unscripted symbols succeed immediately with [`history_csv`].
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<FetchError>>>,
    permanent: Mutex<HashMap<String, FetchError>>,
    calls: Mutex<HashMap<String, usize>>,
    total_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `symbol` with `errors` in order, then succeed.
    pub fn fail_then_succeed(self, symbol: &str, errors: Vec<FetchError>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(symbol.to_string(), errors.into());
        self
    }

    /// Fail every request for `symbol` with `error`.
    pub fn always_fail(self, symbol: &str, error: FetchError) -> Self {
        self.permanent
            .lock()
            .unwrap()
            .insert(symbol.to_string(), error);
        self
    }

    pub fn calls_for(&self, symbol: &str) -> usize {
        self.calls.lock().unwrap().get(symbol).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }
}

impl QuoteProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, entry: &ManifestEntry) -> Result<RawPayload, FetchError> {
        let symbol = entry.symbol.as_str();
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_insert(0) += 1;

        if let Some(err) = self.permanent.lock().unwrap().get(symbol) {
            return Err(err.clone());
        }
        if let Some(queue) = self.scripts.lock().unwrap().get_mut(symbol) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(RawPayload {
            body: history_csv(symbol).into_bytes(),
            fetched_at: Utc::now(),
        })
    }
}
