// ⏰ Temporal Model
// "Identity persists. Values change."
//
// An entity id is the identity. Its attribute sets are values, each valid
// over a half-open interval [valid_since, valid_until). The current record
// is the open interval; history rows are the closed ones.

use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// All timestamps are kept at microsecond precision so that what is written
/// to storage compares equal to what is read back.
pub fn truncate_to_micros(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(6)
}

/// Years that keep the text form four digits wide and readable by
/// `parse_timestamp`.
pub const STORABLE_YEARS: std::ops::RangeInclusive<i32> = 1..=9999;

/// Whether `time` survives a `format_timestamp`/`parse_timestamp` round
/// trip with its ordering intact.
pub fn is_storable(time: DateTime<Utc>) -> bool {
    STORABLE_YEARS.contains(&time.year())
}

/// Fixed-width RFC 3339 (`2024-01-01T00:00:00.000000Z`).
/// Lexical order of the text equals chronological order for storable times.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    truncate_to_micros(time).to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// INTERVAL
// ============================================================================

/// Half-open validity interval. `until == None` means still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

impl Interval {
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.since <= time && self.until.map_or(true, |until| time < until)
    }

    pub fn is_open(&self) -> bool {
        self.until.is_none()
    }
}

// ============================================================================
// CURRENT RECORD
// ============================================================================

/// Live state of one entity.
///
/// `effective_since` and `generation` are bookkeeping for the store and are
/// not part of the entity's public attribute shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentRecord<A> {
    pub id: String,
    pub attrs: A,
    pub effective_since: DateTime<Utc>,
    /// Incremented each time an id is re-created after a delete.
    pub generation: u32,
}

impl<A> CurrentRecord<A> {
    pub fn interval(&self) -> Interval {
        Interval {
            since: self.effective_since,
            until: None,
        }
    }
}

// ============================================================================
// HISTORY ROW
// ============================================================================

/// One closed interval of a past attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow<A> {
    pub id: String,
    pub valid_since: DateTime<Utc>,
    /// Only `None` inside an uncommitted transition.
    pub valid_until: Option<DateTime<Utc>>,
    pub generation: u32,
    pub attrs: A,
}

impl<A> HistoryRow<A> {
    pub fn interval(&self) -> Interval {
        Interval {
            since: self.valid_since,
            until: self.valid_until,
        }
    }

    /// Was this attribute set in effect at `time`?
    pub fn was_valid_at(&self, time: DateTime<Utc>) -> bool {
        self.interval().contains(time)
    }
}

// ============================================================================
// TIMELINE
// ============================================================================

/// Every state of one generation of an entity: closed history plus the open
/// interval, if the entity still exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline<A> {
    pub id: String,
    pub generation: u32,
    /// Ascending by `valid_since`.
    pub history: Vec<HistoryRow<A>>,
    pub current: Option<CurrentRecord<A>>,
}

impl<A> Timeline<A> {
    /// Attribute set in effect at `time`, if any.
    pub fn as_of(&self, time: DateTime<Utc>) -> Option<&A> {
        if let Some(current) = &self.current {
            if time >= current.effective_since {
                return Some(&current.attrs);
            }
        }
        self.history
            .iter()
            .find(|row| row.was_valid_at(time))
            .map(|row| &row.attrs)
    }

    /// Intervals in order, the open one (if any) last.
    pub fn intervals(&self) -> Vec<Interval> {
        let mut intervals: Vec<Interval> = self.history.iter().map(|r| r.interval()).collect();
        if let Some(current) = &self.current {
            intervals.push(current.interval());
        }
        intervals
    }

    /// When this generation was created.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.history
            .first()
            .map(|row| row.valid_since)
            .or_else(|| self.current.as_ref().map(|c| c.effective_since))
    }

    pub fn is_deleted(&self) -> bool {
        self.current.is_none()
    }

    pub fn version_count(&self) -> usize {
        self.history.len() + usize::from(self.current.is_some())
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Consistent view of every entity of one kind at a point in time.
///
/// Use case: "Show me every currency price as it was on 2024-12-31"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<A> {
    pub snapshot_id: String,
    pub as_of: DateTime<Utc>,
    pub kind: String,
    /// `(id, attrs)` pairs, ordered by id.
    pub values: Vec<(String, A)>,
}

impl<A> Snapshot<A> {
    pub fn new(kind: &str, as_of: DateTime<Utc>, values: Vec<(String, A)>) -> Self {
        Snapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            as_of,
            kind: kind.to_string(),
            values,
        }
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, id: &str) -> Option<&A> {
        self.values
            .iter()
            .find(|(value_id, _)| value_id == id)
            .map(|(_, attrs)| attrs)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn row(since: i64, until: i64, phone: &str) -> HistoryRow<String> {
        HistoryRow {
            id: "r1".to_string(),
            valid_since: t(since),
            valid_until: Some(t(until)),
            generation: 0,
            attrs: phone.to_string(),
        }
    }

    fn timeline() -> Timeline<String> {
        Timeline {
            id: "r1".to_string(),
            generation: 0,
            history: vec![row(0, 10, "111"), row(10, 20, "222")],
            current: Some(CurrentRecord {
                id: "r1".to_string(),
                attrs: "333".to_string(),
                effective_since: t(20),
                generation: 0,
            }),
        }
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = format_timestamp(t(0));
        let b = format_timestamp(t(0) + Duration::nanoseconds(1_500));

        assert_eq!(a, "2024-01-01T00:00:00.000000Z");
        assert_eq!(b, "2024-01-01T00:00:00.000001Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn test_storable_range_round_trips() {
        let first = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        for time in [first, last] {
            assert!(is_storable(time));
            assert_eq!(parse_timestamp(&format_timestamp(time)).unwrap(), time);
        }
        assert!(format_timestamp(first) < format_timestamp(t(0)));
        assert!(format_timestamp(t(0)) < format_timestamp(last));

        let too_late = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let too_early = Utc.with_ymd_and_hms(0, 12, 31, 0, 0, 0).unwrap();
        assert!(!is_storable(too_late));
        assert!(!is_storable(too_early));
    }

    #[test]
    fn test_timestamp_round_trip_at_micro_precision() {
        let time = t(42) + Duration::nanoseconds(123_456_789);
        let parsed = parse_timestamp(&format_timestamp(time)).unwrap();
        assert_eq!(parsed, truncate_to_micros(time));
    }

    #[test]
    fn test_interval_is_half_open() {
        let interval = Interval {
            since: t(0),
            until: Some(t(10)),
        };
        assert!(interval.contains(t(0)));
        assert!(interval.contains(t(9)));
        assert!(!interval.contains(t(10)));
        assert!(!interval.contains(t(-1)));

        let open = Interval {
            since: t(10),
            until: None,
        };
        assert!(open.is_open());
        assert!(open.contains(t(1_000_000)));
    }

    #[test]
    fn test_timeline_as_of() {
        let timeline = timeline();

        assert_eq!(timeline.as_of(t(-1)), None);
        assert_eq!(timeline.as_of(t(0)).unwrap(), "111");
        assert_eq!(timeline.as_of(t(5)).unwrap(), "111");
        assert_eq!(timeline.as_of(t(10)).unwrap(), "222");
        assert_eq!(timeline.as_of(t(20)).unwrap(), "333");
        assert_eq!(timeline.as_of(t(99)).unwrap(), "333");
    }

    #[test]
    fn test_timeline_intervals_are_contiguous() {
        let intervals = timeline().intervals();
        assert_eq!(intervals.len(), 3);
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].until, Some(pair[1].since));
        }
        assert!(intervals[2].is_open());
    }

    #[test]
    fn test_deleted_timeline() {
        let mut timeline = timeline();
        timeline.current = None;

        assert!(timeline.is_deleted());
        assert_eq!(timeline.version_count(), 2);
        assert_eq!(timeline.created_at(), Some(t(0)));
        assert_eq!(timeline.as_of(t(25)), None);
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = Snapshot::new(
            "currency_price",
            t(0),
            vec![("CLP".to_string(), 1), ("UF".to_string(), 2)],
        );

        assert_eq!(snapshot.count(), 2);
        assert_eq!(snapshot.get("UF"), Some(&2));
        assert_eq!(snapshot.get("USD"), None);
        assert!(!snapshot.snapshot_id.is_empty());
    }
}
