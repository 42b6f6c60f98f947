//! Stockdump Core: domain types, manifest, dump store, provider access and
//! the consolidated quote table.
//!
//! This crate holds everything that touches a file format or the wire:
//! - Domain types (symbols, redacted secrets, quote records)
//! - Append-only JSONL request manifest
//! - zstd dump store with atomic temp-then-rename writes
//! - Provider trait and the Yahoo chart provider
//! - Payload parsers (chart JSON, history CSV)
//! - Consolidated table encodings (Parquet, Feather, CSV)
//!
//! Orchestration (worker pools, retries, summaries) lives in `stockdump-runner`.

pub mod data;
pub mod domain;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: types shared with fetch workers are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::Symbol>();
        require_sync::<domain::Symbol>();
        require_send::<domain::QuoteRecord>();
        require_sync::<domain::QuoteRecord>();
        require_send::<data::ManifestEntry>();
        require_sync::<data::ManifestEntry>();
        require_send::<data::DumpStore>();
        require_sync::<data::DumpStore>();
        require_send::<data::RequestThrottle>();
        require_sync::<data::RequestThrottle>();
        require_send::<data::YahooProvider>();
        require_sync::<data::YahooProvider>();
        require_send::<data::FetchError>();
        require_sync::<data::FetchError>();
    }

    /// Provider is object-safe so the fetcher can hold `&dyn QuoteProvider`.
    #[test]
    fn quote_provider_is_object_safe() {
        fn _takes_dyn(p: &dyn data::QuoteProvider, e: &data::ManifestEntry) {
            let _ = p.fetch(e);
        }
    }
}
