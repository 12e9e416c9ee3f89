//! Temporal versioning store.
//!
//! One generic component for every versioned kind. For each entity id it
//! keeps a current record plus an append-only, gap-free history of every
//! attribute set the entity has held.
//!
//! State machine per id:
//!
//! ```text
//! NONEXISTENT -> CURRENT(t0) -> CURRENT(t1) -> ... -> DELETED -> CURRENT(tK) ...
//! ```
//!
//! Every arrow out of `CURRENT(tN)` is one backend transaction that appends
//! the closed interval `[tN, at)` and advances or removes the current record.
//! Writers race optimistically on `effective_since`; losers get
//! `ConcurrentModification` and retry from a fresh read.

use crate::backend::{Persistence, Transition};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, VersioningError};
use crate::temporal::{
    is_storable, truncate_to_micros, CurrentRecord, HistoryRow, Snapshot, Timeline, STORABLE_YEARS,
};
use crate::versioned::Versioned;
use backon::{BlockingRetryable, ExponentialBuilder};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of history rows fetched per backend round trip.
pub const DEFAULT_PAGE_SIZE: usize = 256;

pub struct TemporalStore<A, B, C = SystemClock> {
    backend: Arc<B>,
    clock: Arc<C>,
    page_size: usize,
    _kind: PhantomData<fn() -> A>,
}

impl<A, B, C> Clone for TemporalStore<A, B, C> {
    fn clone(&self) -> Self {
        TemporalStore {
            backend: Arc::clone(&self.backend),
            clock: Arc::clone(&self.clock),
            page_size: self.page_size,
            _kind: PhantomData,
        }
    }
}

impl<A, B> TemporalStore<A, B, SystemClock>
where
    A: Versioned,
    B: Persistence<A>,
{
    /// Store on the wall clock. Creates the kind's tables if missing.
    pub fn new(backend: Arc<B>) -> Result<Self> {
        Self::with_clock(backend, Arc::new(SystemClock::new()))
    }
}

impl<A, B, C> TemporalStore<A, B, C>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    pub fn with_clock(backend: Arc<B>, clock: Arc<C>) -> Result<Self> {
        backend.ensure_schema()?;
        Ok(TemporalStore {
            backend,
            clock,
            page_size: DEFAULT_PAGE_SIZE,
            _kind: PhantomData,
        })
    }

    /// Rows per page for `read_history`. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn kind(&self) -> &'static str {
        A::KIND
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub fn create(&self, id: &str, attrs: A) -> Result<CurrentRecord<A>> {
        self.create_at(id, attrs, self.clock.now())
    }

    /// Create the current record effective from `at`. No history row.
    pub fn create_at(&self, id: &str, attrs: A, at: DateTime<Utc>) -> Result<CurrentRecord<A>> {
        let at = truncate_to_micros(at);
        self.check_storable(id, at)?;
        let record = self.backend.insert_current(id, &attrs, at)?;
        info!(
            kind = A::KIND,
            id,
            generation = record.generation,
            effective_since = %at,
            "created"
        );
        Ok(record)
    }

    /// Update at the clock's now, taken after the current record is read.
    pub fn update(&self, id: &str, attrs: A) -> Result<HistoryRow<A>> {
        let current = self.require_current(id)?;
        let at = self.clock.now();
        self.update_expecting(id, current.effective_since, attrs, at)
    }

    /// Close the current interval at `at` and make `attrs` current.
    ///
    /// Returns the history row that was appended.
    pub fn update_at(&self, id: &str, attrs: A, at: DateTime<Utc>) -> Result<HistoryRow<A>> {
        let current = self.require_current(id)?;
        self.update_expecting(id, current.effective_since, attrs, at)
    }

    /// Optimistic update against an `effective_since` the caller read earlier.
    pub fn update_expecting(
        &self,
        id: &str,
        expected_since: DateTime<Utc>,
        attrs: A,
        at: DateTime<Utc>,
    ) -> Result<HistoryRow<A>> {
        let at = truncate_to_micros(at);
        self.check_storable(id, at)?;
        self.check_monotonic(id, expected_since, at)?;
        self.commit(id, expected_since, Transition::Replace { attrs, at })
    }

    pub fn delete(&self, id: &str) -> Result<HistoryRow<A>> {
        let current = self.require_current(id)?;
        let at = self.clock.now();
        self.remove(id, current.effective_since, at)
    }

    /// Close the final interval at `at` and remove the current record.
    /// History is kept.
    pub fn delete_at(&self, id: &str, at: DateTime<Utc>) -> Result<HistoryRow<A>> {
        let current = self.require_current(id)?;
        self.remove(id, current.effective_since, at)
    }

    fn remove(&self, id: &str, expected_since: DateTime<Utc>, at: DateTime<Utc>) -> Result<HistoryRow<A>> {
        let at = truncate_to_micros(at);
        self.check_storable(id, at)?;
        self.check_monotonic(id, expected_since, at)?;
        self.commit(id, expected_since, Transition::Remove { at })
    }

    fn check_monotonic(&self, id: &str, since: DateTime<Utc>, at: DateTime<Utc>) -> Result<()> {
        if at <= since {
            return Err(VersioningError::invalid_timestamp(
                A::KIND,
                id,
                at,
                format!("must be after {}", since),
            ));
        }
        Ok(())
    }

    // Timestamps are persisted as four-digit-year text; anything wider
    // would be unreadable and sort out of order.
    fn check_storable(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        if !is_storable(at) {
            return Err(VersioningError::invalid_timestamp(
                A::KIND,
                id,
                at,
                format!(
                    "year must be within {}..={}",
                    STORABLE_YEARS.start(),
                    STORABLE_YEARS.end()
                ),
            ));
        }
        Ok(())
    }

    fn commit(
        &self,
        id: &str,
        expected_since: DateTime<Utc>,
        transition: Transition<A>,
    ) -> Result<HistoryRow<A>> {
        let removing = matches!(transition, Transition::Remove { .. });
        match self.backend.commit_transition(id, expected_since, transition) {
            Ok(row) => {
                info!(
                    kind = A::KIND,
                    id,
                    valid_since = %row.valid_since,
                    valid_until = ?row.valid_until,
                    "{}",
                    if removing { "deleted" } else { "updated" }
                );
                Ok(row)
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(kind = A::KIND, id, expected = %expected_since, "lost optimistic race");
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn read_current(&self, id: &str) -> Result<A> {
        self.require_current(id).map(|record| record.attrs)
    }

    /// Current attributes with their `effective_since` and generation.
    pub fn read_record(&self, id: &str) -> Result<CurrentRecord<A>> {
        self.require_current(id)
    }

    fn require_current(&self, id: &str) -> Result<CurrentRecord<A>> {
        debug!(kind = A::KIND, id, "read current");
        self.backend
            .load_current(id)?
            .ok_or_else(|| VersioningError::not_found(A::KIND, id))
    }

    /// Attribute set in effect at `time`.
    ///
    /// `NotFound` if `time` precedes creation or falls after deletion.
    pub fn read_as_of(&self, id: &str, time: DateTime<Utc>) -> Result<A> {
        let time = truncate_to_micros(time);
        debug!(kind = A::KIND, id, as_of = %time, "read as of");

        if let Some(current) = self.backend.load_current(id)? {
            if time >= current.effective_since {
                return Ok(current.attrs);
            }
        }
        // No stored interval reaches outside the storable range
        if !is_storable(time) {
            return Err(VersioningError::not_found(A::KIND, id));
        }
        self.backend
            .history_at(id, time)?
            .map(|row| row.attrs)
            .ok_or_else(|| VersioningError::not_found(A::KIND, id))
    }

    /// History of the latest generation, oldest first. Excludes the open
    /// interval; combine with `read_current` for the full timeline.
    pub fn read_history(&self, id: &str) -> Result<HistoryCursor<A, B>> {
        let generation = self.latest_generation(id)?;
        Ok(self.read_history_generation(id, generation))
    }

    /// History of one specific generation of `id`.
    pub fn read_history_generation(&self, id: &str, generation: u32) -> HistoryCursor<A, B> {
        HistoryCursor::new(Arc::clone(&self.backend), id, generation, self.page_size)
    }

    /// Generation of the current record, or of the newest history row if
    /// the entity is deleted.
    pub fn latest_generation(&self, id: &str) -> Result<u32> {
        if let Some(current) = self.backend.load_current(id)? {
            return Ok(current.generation);
        }
        self.backend
            .last_history_row(id)?
            .map(|row| row.generation)
            .ok_or_else(|| VersioningError::not_found(A::KIND, id))
    }

    /// Closed history plus the open interval of the latest generation.
    pub fn timeline(&self, id: &str) -> Result<Timeline<A>> {
        let generation = self.latest_generation(id)?;
        let history = self
            .read_history_generation(id, generation)
            .collect::<Result<Vec<_>>>()?;
        let current = self
            .backend
            .load_current(id)?
            .filter(|record| record.generation == generation);

        Ok(Timeline {
            id: id.to_string(),
            generation,
            history,
            current,
        })
    }

    /// Every entity of this kind as it was at `time`.
    pub fn snapshot_as_of(&self, time: DateTime<Utc>) -> Result<Snapshot<A>> {
        let time = truncate_to_micros(time);
        let mut values = Vec::new();

        for id in self.backend.known_ids()? {
            match self.read_as_of(&id, time) {
                Ok(attrs) => values.push((id, attrs)),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        Ok(Snapshot::new(A::KIND, time, values))
    }
}

// ============================================================================
// HISTORY CURSOR
// ============================================================================

/// Lazy, finite iterator over one generation's history.
///
/// Pages through the backend by `valid_since`, so nothing is read twice.
/// Iteration ends only on an empty page, so rows appended before that last
/// fetch are picked up. Clone it or call `restart` to read again from the
/// beginning. Stops after the first error.
pub struct HistoryCursor<A, B> {
    backend: Arc<B>,
    id: String,
    generation: u32,
    page_size: usize,
    buffer: VecDeque<HistoryRow<A>>,
    last_seen: Option<DateTime<Utc>>,
    exhausted: bool,
}

impl<A: Versioned, B: Persistence<A>> HistoryCursor<A, B> {
    fn new(backend: Arc<B>, id: &str, generation: u32, page_size: usize) -> Self {
        HistoryCursor {
            backend,
            id: id.to_string(),
            generation,
            page_size,
            buffer: VecDeque::new(),
            last_seen: None,
            exhausted: false,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Fresh cursor over the same id and generation.
    pub fn restart(&self) -> Self {
        Self::new(
            Arc::clone(&self.backend),
            &self.id,
            self.generation,
            self.page_size,
        )
    }

    fn fill(&mut self) -> Result<()> {
        let page = self
            .backend
            .history_page(&self.id, self.generation, self.last_seen, self.page_size)?;
        if page.is_empty() {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<A: Versioned, B: Persistence<A>> Clone for HistoryCursor<A, B> {
    fn clone(&self) -> Self {
        self.restart()
    }
}

impl<A: Versioned, B: Persistence<A>> Iterator for HistoryCursor<A, B> {
    type Item = Result<HistoryRow<A>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }

        let row = self.buffer.pop_front()?;
        self.last_seen = Some(row.valid_since);
        Some(Ok(row))
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Run `op` until it stops failing with `ConcurrentModification`, backing
/// off exponentially, at most `max_retries` extra attempts.
///
/// `op` must re-read state on every call (e.g. call `update`, not
/// `update_expecting` with a stale timestamp).
pub fn retry_on_conflict<T, F>(max_retries: usize, op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    op.retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(250))
            .with_max_times(max_retries),
    )
    .sleep(std::thread::sleep)
    .when(|err: &VersioningError| err.is_retryable())
    .notify(|err, delay| {
        warn!("retrying after {:?}: {}", delay, err);
    })
    .call()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::entities::{CurrencyPrice, Realtor};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::cell::Cell;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    type RealtorStore = TemporalStore<Realtor, MemoryBackend<Realtor>, ManualClock>;

    fn store() -> RealtorStore {
        TemporalStore::with_clock(
            Arc::new(MemoryBackend::new()),
            Arc::new(ManualClock::new(t(0))),
        )
        .unwrap()
    }

    fn ana(phone: &str) -> Realtor {
        Realtor::new("Ana", "Soto", phone)
    }

    #[test]
    fn test_ana_scenario() {
        let store = store();
        store.create_at("R1", ana("111"), t(0)).unwrap();
        store.update_at("R1", ana("222"), t(10)).unwrap();

        assert_eq!(store.read_as_of("R1", t(5)).unwrap().phone, "111");
        assert_eq!(store.read_current("R1").unwrap().phone, "222");

        let history: Vec<_> = store
            .read_history("R1")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].valid_since, t(0));
        assert_eq!(history[0].valid_until, Some(t(10)));
        assert_eq!(history[0].attrs, ana("111"));
    }

    #[test]
    fn test_create_produces_no_history() {
        let store = store();
        assert_eq!(store.kind(), "realtor");
        store.create("R1", ana("111")).unwrap();

        assert_eq!(store.read_history("R1").unwrap().count(), 0);
        assert!(matches!(
            store.create("R1", ana("999")),
            Err(VersioningError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_update_uses_clock_by_default() {
        let store = store();
        store.create("R1", ana("111")).unwrap();
        store.clock().advance(ChronoDuration::seconds(30));

        let row = store.update("R1", ana("222")).unwrap();
        assert_eq!(row.valid_until, Some(t(30)));
        assert_eq!(store.read_record("R1").unwrap().effective_since, t(30));
    }

    #[test]
    fn test_unstorable_timestamps_are_rejected() {
        let store = store();
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();

        let err = store.create_at("R1", ana("111"), far).unwrap_err();
        assert!(matches!(err, VersioningError::InvalidTimestamp { .. }));
        assert!(store.read_current("R1").unwrap_err().is_not_found());

        store.create_at("R1", ana("111"), t(0)).unwrap();
        let err = store.update_at("R1", ana("222"), far).unwrap_err();
        assert!(matches!(err, VersioningError::InvalidTimestamp { .. }));
        let err = store.delete_at("R1", far).unwrap_err();
        assert!(matches!(err, VersioningError::InvalidTimestamp { .. }));

        // Reads far ahead still see the live record, then nothing once deleted
        assert_eq!(store.read_as_of("R1", far).unwrap().phone, "111");
        store.delete_at("R1", t(10)).unwrap();
        assert!(store.read_as_of("R1", far).unwrap_err().is_not_found());
    }

    #[test]
    fn test_non_monotonic_timestamps_are_rejected() {
        let store = store();
        store.create_at("R1", ana("111"), t(10)).unwrap();

        for at in [t(10), t(9)] {
            let err = store.update_at("R1", ana("222"), at).unwrap_err();
            assert!(matches!(err, VersioningError::InvalidTimestamp { .. }));
            let err = store.delete_at("R1", at).unwrap_err();
            assert!(matches!(err, VersioningError::InvalidTimestamp { .. }));
        }

        assert_eq!(store.read_current("R1").unwrap().phone, "111");
        assert_eq!(store.read_history("R1").unwrap().count(), 0);
    }

    #[test]
    fn test_missing_entity_is_not_found() {
        let store = store();

        assert!(store.read_current("nope").unwrap_err().is_not_found());
        assert!(store.update_at("nope", ana("1"), t(1)).unwrap_err().is_not_found());
        assert!(store.delete_at("nope", t(1)).unwrap_err().is_not_found());
        assert!(store.read_history("nope").is_err());
    }

    #[test]
    fn test_read_as_of_before_creation_and_after_deletion() {
        let store = store();
        store.create_at("R1", ana("111"), t(10)).unwrap();
        store.delete_at("R1", t(20)).unwrap();

        assert!(store.read_as_of("R1", t(9)).unwrap_err().is_not_found());
        assert_eq!(store.read_as_of("R1", t(10)).unwrap().phone, "111");
        assert_eq!(store.read_as_of("R1", t(19)).unwrap().phone, "111");
        assert!(store.read_as_of("R1", t(20)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_stale_expectation_is_concurrent_modification() {
        let store = store();
        store.create_at("R1", ana("111"), t(0)).unwrap();

        // Both writers read the same state
        let seen_by_a = store.read_record("R1").unwrap().effective_since;
        let seen_by_b = store.read_record("R1").unwrap().effective_since;

        store.update_expecting("R1", seen_by_a, ana("222"), t(10)).unwrap();
        let err = store
            .update_expecting("R1", seen_by_b, ana("333"), t(11))
            .unwrap_err();
        assert!(err.is_retryable());

        // The loser retries from a fresh read
        store.update_at("R1", ana("333"), t(11)).unwrap();

        let history: Vec<_> = store
            .read_history("R1")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].attrs.phone, "222");
        assert_eq!(store.read_current("R1").unwrap().phone, "333");
    }

    #[test]
    fn test_cursor_pages_and_restarts() {
        let store = store().with_page_size(2);
        store.create_at("R1", ana("0"), t(0)).unwrap();
        for i in 1..=5 {
            store.update_at("R1", ana(&i.to_string()), t(i)).unwrap();
        }

        let cursor = store.read_history("R1").unwrap();
        let phones: Vec<String> = cursor
            .clone()
            .map(|row| row.unwrap().attrs.phone)
            .collect();
        assert_eq!(phones, vec!["0", "1", "2", "3", "4"]);

        let again: Vec<_> = cursor.restart().map(|row| row.unwrap().valid_since).collect();
        assert_eq!(again, vec![t(0), t(1), t(2), t(3), t(4)]);
    }

    #[test]
    fn test_delete_then_create_starts_fresh_generation() {
        let store = store();
        store.create_at("R1", ana("111"), t(0)).unwrap();
        store.update_at("R1", ana("222"), t(10)).unwrap();
        store.delete_at("R1", t(20)).unwrap();

        let recreated = store.create_at("R1", ana("999"), t(30)).unwrap();
        assert_eq!(recreated.generation, 2);
        assert_eq!(store.read_history("R1").unwrap().count(), 0);

        let old: Vec<_> = store
            .read_history_generation("R1", 1)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(old.len(), 2);
        assert_eq!(store.read_as_of("R1", t(15)).unwrap().phone, "222");
        assert!(store.read_as_of("R1", t(25)).unwrap_err().is_not_found());
        assert_eq!(store.read_as_of("R1", t(30)).unwrap().phone, "999");
    }

    #[test]
    fn test_timeline_and_snapshot() {
        let store = store();
        store.create_at("R1", ana("111"), t(0)).unwrap();
        store.update_at("R1", ana("222"), t(10)).unwrap();
        store.create_at("R2", Realtor::new("Luis", "Rojas", "555"), t(5)).unwrap();
        store.delete_at("R2", t(8)).unwrap();

        let timeline = store.timeline("R1").unwrap();
        assert_eq!(timeline.version_count(), 2);
        assert_eq!(timeline.as_of(t(3)).unwrap().phone, "111");

        let at_six = store.snapshot_as_of(t(6)).unwrap();
        assert_eq!(at_six.count(), 2);
        assert_eq!(at_six.get("R2").unwrap().first_name, "Luis");

        let at_nine = store.snapshot_as_of(t(9)).unwrap();
        assert_eq!(at_nine.count(), 1);
        assert!(at_nine.get("R2").is_none());
    }

    #[test]
    fn test_retry_on_conflict_gives_up_on_other_errors() {
        let attempts = Cell::new(0);
        let result: Result<()> = retry_on_conflict(3, || {
            attempts.set(attempts.get() + 1);
            Err(VersioningError::not_found("realtor", "R1"))
        });

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_retry_on_conflict_retries_races() {
        let attempts = Cell::new(0);
        let result = retry_on_conflict(3, || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(VersioningError::conflict("currency_price", "UF", t(0)))
            } else {
                Ok(CurrencyPrice::parse("1.5").unwrap())
            }
        });

        assert_eq!(result.unwrap().price.to_string(), "1.5");
        assert_eq!(attempts.get(), 3);
    }
}
