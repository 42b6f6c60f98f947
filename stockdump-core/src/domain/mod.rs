//! Domain types for stockdump

pub mod quote;
pub mod secret;
pub mod symbol;

pub use quote::{normalize_records, QuoteRecord};
pub use secret::Secret;
pub use symbol::{Symbol, SymbolError};
