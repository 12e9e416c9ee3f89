//! Environment-driven configuration.
//! Loads `.env` once, then reads `ESTATE_*` variables with sane defaults.

use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

// Lazily load .env exactly once; a missing file is fine
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenvy::dotenv();
});

pub const DEFAULT_DB_PATH: &str = "estate-history.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 256;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Listen address of the REST server.
    pub bind_addr: String,
    /// Rows fetched per page when reading history.
    pub history_page_size: usize,
    /// How long a writer waits on another process's write lock.
    pub busy_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();

        AppConfig {
            db_path: lookup("ESTATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            bind_addr: lookup("ESTATE_BIND_ADDR").unwrap_or(defaults.bind_addr),
            history_page_size: parse_or(&lookup, "ESTATE_HISTORY_PAGE_SIZE", DEFAULT_HISTORY_PAGE_SIZE)
                .max(1),
            busy_timeout: Duration::from_millis(parse_or(
                &lookup,
                "ESTATE_BUSY_TIMEOUT_MS",
                DEFAULT_BUSY_TIMEOUT_MS,
            )),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid value, using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[]));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_reads_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("ESTATE_DB_PATH", "/tmp/history.db"),
            ("ESTATE_BIND_ADDR", "127.0.0.1:8080"),
            ("ESTATE_HISTORY_PAGE_SIZE", "32"),
            ("ESTATE_BUSY_TIMEOUT_MS", "250"),
        ]));

        assert_eq!(config.db_path, PathBuf::from("/tmp/history.db"));
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.history_page_size, 32);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = AppConfig::from_lookup(lookup(&[
            ("ESTATE_HISTORY_PAGE_SIZE", "lots"),
            ("ESTATE_BUSY_TIMEOUT_MS", "-1"),
        ]));

        assert_eq!(config.history_page_size, DEFAULT_HISTORY_PAGE_SIZE);
        assert_eq!(config.busy_timeout, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));
    }

    #[test]
    fn test_zero_page_size_is_clamped() {
        let config = AppConfig::from_lookup(lookup(&[("ESTATE_HISTORY_PAGE_SIZE", "0")]));
        assert_eq!(config.history_page_size, 1);
    }
}
