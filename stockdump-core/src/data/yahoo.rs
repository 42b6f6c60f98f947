//! Yahoo Finance chart provider.
//!
//! Issues one authenticated GET per manifest entry against the v8 chart API
//! and hands back the raw body. Parsing happens later, at consolidation; the
//! fetcher stores whatever the provider sent.
//!
//! Yahoo Finance has no official API and changes behaviour without notice.
//! Status mapping:
//! - 401/403 → `AuthRejected` (crumb/cookie expired or IP blocked)
//! - 404 → `SymbolNotFound`
//! - 408, 5xx → transient
//! - 429 → `RateLimited`, honouring `Retry-After`
//! - other 4xx → `BadRequest`

use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, Utc};
use reqwest::StatusCode;
use tracing::debug;

use super::manifest::ManifestEntry;
use super::provider::{FetchError, QuoteProvider, RawPayload};

pub const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Yahoo Finance chart provider.
pub struct YahooProvider {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl YahooProvider {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point at a different host (mirrors, local test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Chart endpoint for a symbol, without query parameters.
    pub fn chart_endpoint(&self, entry: &ManifestEntry) -> String {
        let symbol = entry.symbol.as_str().replace('^', "%5E");
        format!("{}/v8/finance/chart/{symbol}", self.base_url)
    }

    /// Query parameters for the request. Includes the crumb; never log this.
    fn query(entry: &ManifestEntry) -> Vec<(&'static str, String)> {
        vec![
            ("period1", day_start_epoch(entry.start).to_string()),
            ("period2", (day_start_epoch(entry.end) + 86_399).to_string()),
            ("interval", entry.interval.as_str().to_string()),
            ("events", "history".to_string()),
            ("includeAdjustedClose", "true".to_string()),
            ("crumb", entry.crumb.expose().to_string()),
        ]
    }
}

impl QuoteProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch(&self, entry: &ManifestEntry) -> Result<RawPayload, FetchError> {
        let url = self.chart_endpoint(entry);
        debug!(symbol = %entry.symbol, %url, crumb = %entry.crumb, "requesting chart");

        let resp = self
            .client
            .get(&url)
            .query(&Self::query(entry))
            .header(reqwest::header::COOKIE, entry.cookie.expose())
            .send()
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(classify_status(status, retry_after));
        }

        let body = resp.bytes().map_err(classify_transport)?;
        if body.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        Ok(RawPayload {
            body: body.to_vec(),
            fetched_at: Utc::now(),
        })
    }
}

fn day_start_epoch(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

fn classify_status(status: StatusCode, retry_after: Option<u64>) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::AuthRejected {
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => FetchError::SymbolNotFound,
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        StatusCode::REQUEST_TIMEOUT => FetchError::Timeout,
        s if s.is_server_error() => FetchError::ServerError { status: s.as_u16() },
        s => FetchError::BadRequest { status: s.as_u16() },
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}
