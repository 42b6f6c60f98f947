//! QuoteRecord: one trading-day observation for one symbol.

use super::Symbol;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily OHLCV observation as reported by the provider.
///
/// Every value field is nullable: illiquid days routinely come back with
/// gaps, and a missing value must stay missing rather than become zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub symbol: Symbol,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<u64>,
}

impl QuoteRecord {
    /// A row with only a key and no values (holiday placeholders).
    pub fn is_void(&self) -> bool {
        self.open.is_none()
            && self.high.is_none()
            && self.low.is_none()
            && self.close.is_none()
            && self.adj_close.is_none()
            && self.volume.is_none()
    }
}

/// Order by date, drop void rows, and keep the last observation per date.
///
/// Providers occasionally repeat the final day (an intraday snapshot followed
/// by the settled bar); the later entry in the payload is the settled one.
pub fn normalize_records(records: Vec<QuoteRecord>) -> Vec<QuoteRecord> {
    let mut indexed: Vec<(usize, QuoteRecord)> = records
        .into_iter()
        .filter(|r| !r.is_void())
        .enumerate()
        .collect();

    // Stable by date, later payload position last within a date.
    indexed.sort_by(|a, b| a.1.date.cmp(&b.1.date).then(a.0.cmp(&b.0)));

    let mut out: Vec<QuoteRecord> = Vec::with_capacity(indexed.len());
    for (_, record) in indexed {
        match out.last_mut() {
            Some(last) if last.date == record.date => *last = record,
            _ => out.push(record),
        }
    }
    out
}
