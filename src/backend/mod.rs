// Persistence collaborator
//
// The store owns the rules; a backend owns atomicity. Every method that
// changes state is all-or-nothing: on error, current record and history are
// exactly as they were before the call.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use crate::error::Result;
use crate::temporal::{CurrentRecord, HistoryRow};
use crate::versioned::Versioned;
use chrono::{DateTime, Utc};

/// What happens to the current record when its interval is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<A> {
    /// Overwrite with new attributes effective from `at`.
    Replace { attrs: A, at: DateTime<Utc> },
    /// Remove the current record; `at` closes the final interval.
    Remove { at: DateTime<Utc> },
}

impl<A> Transition<A> {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Transition::Replace { at, .. } | Transition::Remove { at } => *at,
        }
    }
}

/// Storage for one or more versioned kinds.
///
/// Per kind: a current table keyed by id (with a tracked effective-since
/// timestamp and generation) and an append-only history table keyed by
/// `(id, valid_since)`.
pub trait Persistence<A: Versioned>: Send + Sync {
    /// Create tables if missing. Idempotent.
    fn ensure_schema(&self) -> Result<()>;

    /// Insert the first current record of a new generation.
    ///
    /// The generation is one past the newest history row for `id` (or 1).
    /// Fails with `AlreadyExists` if a current record exists, and with
    /// `InvalidTimestamp` if `at` precedes the end of the id's last closed
    /// interval.
    fn insert_current(&self, id: &str, attrs: &A, at: DateTime<Utc>) -> Result<CurrentRecord<A>>;

    fn load_current(&self, id: &str) -> Result<Option<CurrentRecord<A>>>;

    /// Compare-and-swap on `effective_since`, plus a history append.
    ///
    /// Atomically appends `{id, expected_since, transition.at(), <stored attrs>}`
    /// and replaces or removes the current record. `NotFound` if there is no
    /// current record, `ConcurrentModification` if its `effective_since` is
    /// not `expected_since`. Returns the appended row.
    fn commit_transition(
        &self,
        id: &str,
        expected_since: DateTime<Utc>,
        transition: Transition<A>,
    ) -> Result<HistoryRow<A>>;

    /// Up to `limit` rows of one generation with `valid_since > after`,
    /// ascending.
    fn history_page(
        &self,
        id: &str,
        generation: u32,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<HistoryRow<A>>>;

    /// The row of any generation whose interval contains `time`.
    fn history_at(&self, id: &str, time: DateTime<Utc>) -> Result<Option<HistoryRow<A>>>;

    /// Newest history row of any generation.
    fn last_history_row(&self, id: &str) -> Result<Option<HistoryRow<A>>>;

    /// Every id with a current record or at least one history row, sorted.
    fn known_ids(&self) -> Result<Vec<String>>;
}
