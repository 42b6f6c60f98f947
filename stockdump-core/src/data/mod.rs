//! Manifest, dump store, provider access and the consolidated table.

pub mod manifest;
pub mod parse;
pub mod provider;
pub mod schema;
pub mod store;
pub mod table;
pub mod throttle;
pub mod yahoo;

pub use manifest::{
    AppendReport, Credentials, FetchWindow, Interval, Manifest, ManifestEntry, ManifestError,
};
pub use parse::{parse_payload, DumpFormat, ParseError};
pub use provider::{FailureKind, FetchError, QuoteProvider, RawPayload};
pub use schema::{QuoteSchema, SchemaError};
pub use store::{DumpFile, DumpInfo, DumpReader, DumpStore, StoreError};
pub use table::{
    ConsolidatedTable, SkippedSymbol, SymbolOutcome, TableBuild, TableBuilder, TableError,
    TableFormat,
};
pub use throttle::RequestThrottle;
pub use yahoo::YahooProvider;
