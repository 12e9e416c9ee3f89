// Estate History - Core Library
// Bitemporal versioning for the listing platform's mutable entities
// (realtors, users, currency prices). Used by the CLI, API server and tests.

pub mod audit;
pub mod backend;
pub mod clock;
pub mod config;
pub mod entities;
pub mod error;
pub mod store;
pub mod temporal;
pub mod versioned;

// Re-export commonly used types
pub use audit::{export_history_csv, verify_timeline, Severity, TimelineIssue, TimelineReport};
pub use backend::{MemoryBackend, Persistence, SqliteBackend, Transition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use entities::{CurrencyPrice, Realtor, User};
pub use error::{Result, VersioningError};
pub use store::{retry_on_conflict, HistoryCursor, TemporalStore};
pub use temporal::{CurrentRecord, HistoryRow, Interval, Snapshot, Timeline};
pub use versioned::{Column, Versioned};

use std::sync::Arc;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Stores for every versioned kind, sharing one SQLite connection.
pub struct Stores {
    pub realtors: TemporalStore<Realtor, SqliteBackend>,
    pub users: TemporalStore<User, SqliteBackend>,
    pub currency_prices: TemporalStore<CurrencyPrice, SqliteBackend>,
}

impl Stores {
    /// Open the configured database and make sure every kind's tables exist.
    pub fn open(config: &AppConfig) -> Result<Self> {
        let backend = Arc::new(SqliteBackend::open(&config.db_path, config.busy_timeout)?);
        Self::from_backend(backend, config.history_page_size)
    }

    pub fn from_backend(backend: Arc<SqliteBackend>, page_size: usize) -> Result<Self> {
        Ok(Stores {
            realtors: TemporalStore::<Realtor, _>::new(backend.clone())?.with_page_size(page_size),
            users: TemporalStore::<User, _>::new(backend.clone())?.with_page_size(page_size),
            currency_prices: TemporalStore::<CurrencyPrice, _>::new(backend)?.with_page_size(page_size),
        })
    }
}

/// Run `$body` with `$store` bound to the store for the kind named by
/// `$kind` (`realtor`, `user`, `currency_price`), or `$fallback` otherwise.
#[macro_export]
macro_rules! with_kind_store {
    ($stores:expr, $kind:expr, |$store:ident| $body:expr, $fallback:expr) => {
        match $kind {
            "realtor" => {
                let $store = &$stores.realtors;
                $body
            }
            "user" => {
                let $store = &$stores.users;
                $body
            }
            "currency_price" => {
                let $store = &$stores.currency_prices;
                $body
            }
            _ => $fallback,
        }
    };
}
