//! Provider payload parsing.
//!
//! Two wire shapes are accepted, detected from the first non-whitespace byte:
//! - Yahoo v8 chart JSON (`{"chart": {"result": [...]}}`)
//! - Yahoo history CSV (`Date,Open,High,Low,Close,Adj Close,Volume`)
//!
//! Payloads fetched on different days drift: columns reorder, `Adj Close`
//! disappears, arrays come back short. Anything missing becomes `None`.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use thiserror::Error;

use crate::domain::{normalize_records, QuoteRecord, Symbol};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload is empty")]
    Empty,

    #[error("malformed chart JSON: {0}")]
    Json(String),

    #[error("provider reported {code}: {description}")]
    Provider { code: String, description: String },

    #[error("response format changed: {0}")]
    FormatChanged(String),

    #[error("missing column '{0}'")]
    MissingColumn(&'static str),

    #[error("line {line}: invalid {column} value '{value}'")]
    InvalidValue {
        line: u64,
        column: &'static str,
        value: String,
    },

    #[error("csv: {0}")]
    Csv(String),

    #[error("no observations in payload")]
    NoRows,
}

/// Payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    ChartJson,
    Csv,
}

impl DumpFormat {
    /// Guess from the leading bytes.
    pub fn detect(payload: &[u8]) -> Self {
        match payload.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => DumpFormat::ChartJson,
            _ => DumpFormat::Csv,
        }
    }
}

impl FromStr for DumpFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(DumpFormat::ChartJson),
            "csv" => Ok(DumpFormat::Csv),
            other => Err(format!("unknown dump format '{other}' (valid: json, csv)")),
        }
    }
}

/// Parse one symbol's payload into date-ordered, de-duplicated records.
pub fn parse_payload(
    symbol: &Symbol,
    payload: &[u8],
    hint: Option<DumpFormat>,
) -> Result<Vec<QuoteRecord>, ParseError> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty);
    }
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
    let text = text.trim_start_matches('\u{feff}');

    let records = match hint.unwrap_or_else(|| DumpFormat::detect(text.as_bytes())) {
        DumpFormat::ChartJson => parse_chart_json(symbol, text)?,
        DumpFormat::Csv => parse_history_csv(symbol, text)?,
    };

    let records = normalize_records(records);
    if records.is_empty() {
        return Err(ParseError::NoRows);
    }
    Ok(records)
}

// ── Chart JSON ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteData>,
    #[serde(default)]
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

fn parse_chart_json(symbol: &Symbol, text: &str) -> Result<Vec<QuoteRecord>, ParseError> {
    let resp: ChartResponse =
        serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;

    let result = match (resp.chart.result, resp.chart.error) {
        (_, Some(err)) => {
            return Err(ParseError::Provider {
                code: err.code,
                description: err.description,
            })
        }
        (Some(result), None) => result,
        (None, None) => {
            return Err(ParseError::FormatChanged(
                "empty result with no error".into(),
            ))
        }
    };

    let data = result
        .into_iter()
        .next()
        .ok_or_else(|| ParseError::FormatChanged("result array is empty".into()))?;

    // A listed symbol with no trades in the window has no timestamp array.
    let timestamps = data.timestamp.unwrap_or_default();
    let offset = data.meta.and_then(|m| m.gmtoffset).unwrap_or(0);

    let quote = data.indicators.quote.into_iter().next().unwrap_or_default();
    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose)
        .unwrap_or_default();

    let at = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten().filter(|x| x.is_finite());

    let mut records = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        // Exchange-local calendar day.
        let date = ts
            .checked_add(offset)
            .and_then(|local| DateTime::from_timestamp(local, 0))
            .map(|dt| dt.date_naive())
            .ok_or_else(|| ParseError::FormatChanged(format!("invalid timestamp: {ts}")))?;

        records.push(QuoteRecord {
            symbol: symbol.clone(),
            date,
            open: at(&quote.open, i),
            high: at(&quote.high, i),
            low: at(&quote.low, i),
            close: at(&quote.close, i),
            adj_close: at(&adj_closes, i),
            volume: at(&quote.volume, i).and_then(volume_from_f64),
        });
    }

    Ok(records)
}

// ── History CSV ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CsvColumns {
    date: Option<usize>,
    open: Option<usize>,
    high: Option<usize>,
    low: Option<usize>,
    close: Option<usize>,
    adj_close: Option<usize>,
    volume: Option<usize>,
}

impl CsvColumns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let mut cols = CsvColumns::default();
        for (i, h) in headers.iter().enumerate() {
            let key: String = h
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase();
            let slot = match key.as_str() {
                "date" | "datetime" | "timestamp" => &mut cols.date,
                "open" => &mut cols.open,
                "high" => &mut cols.high,
                "low" => &mut cols.low,
                "close" => &mut cols.close,
                "adjclose" | "adjustedclose" => &mut cols.adj_close,
                "volume" => &mut cols.volume,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(i);
            }
        }
        cols
    }
}

fn parse_history_csv(symbol: &Symbol, text: &str) -> Result<Vec<QuoteRecord>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParseError::Csv(e.to_string()))?
        .clone();
    let cols = CsvColumns::from_headers(&headers);
    let date_col = cols.date.ok_or(ParseError::MissingColumn("Date"))?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| ParseError::Csv(e.to_string()))?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);

        let raw_date = row.get(date_col).unwrap_or_default();
        if raw_date.is_empty() {
            continue;
        }
        let date = parse_csv_date(raw_date).ok_or_else(|| ParseError::InvalidValue {
            line,
            column: "Date",
            value: raw_date.to_string(),
        })?;

        let num = |col: Option<usize>, name: &'static str| -> Result<Option<f64>, ParseError> {
            let Some(raw) = col.and_then(|c| row.get(c)) else {
                return Ok(None);
            };
            if raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("nan")
            {
                return Ok(None);
            }
            raw.parse::<f64>()
                .map(|v| Some(v).filter(|x| x.is_finite()))
                .map_err(|_| ParseError::InvalidValue {
                    line,
                    column: name,
                    value: raw.to_string(),
                })
        };

        records.push(QuoteRecord {
            symbol: symbol.clone(),
            date,
            open: num(cols.open, "Open")?,
            high: num(cols.high, "High")?,
            low: num(cols.low, "Low")?,
            close: num(cols.close, "Close")?,
            adj_close: num(cols.adj_close, "Adj Close")?,
            volume: num(cols.volume, "Volume")?.and_then(volume_from_f64),
        });
    }

    Ok(records)
}

/// `YYYY-MM-DD`, optionally followed by a time component.
fn parse_csv_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn volume_from_f64(v: f64) -> Option<u64> {
    (v.is_finite() && v >= 0.0).then(|| v.round() as u64)
}
