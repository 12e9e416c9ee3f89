// 🔍 Timeline Audit
// Verifies that stored history still partitions each generation's lifetime
// with no gaps, no overlaps and no open rows, and exports history as CSV.

use crate::backend::Persistence;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::TemporalStore;
use crate::temporal::{format_timestamp, CurrentRecord, HistoryRow};
use crate::versioned::Versioned;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::warn;

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Invariant broken: point-in-time reads may be wrong
    Warning,  // Suspicious but readable (e.g. an unclosed final row)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineIssue {
    pub generation: u32,
    pub severity: Severity,
    /// `valid_since` of the row the issue was found on
    pub at: DateTime<Utc>,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineReport {
    pub kind: String,
    pub id: String,
    pub generations: u32,
    pub rows_checked: usize,
    pub issues: Vec<TimelineIssue>,
}

impl TimelineReport {
    pub fn is_consistent(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|issue| issue.severity == Severity::Critical)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} '{}': {} generation(s), {} history row(s), {} issue(s) ({} critical)",
            self.kind,
            self.id,
            self.generations,
            self.rows_checked,
            self.issues.len(),
            self.issues
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count()
        )
    }
}

// ============================================================================
// CHECKS
// ============================================================================

/// Check one generation: rows ascending, closed, contiguous, and the last
/// row ending where the current record begins.
pub fn check_generation<A>(
    generation: u32,
    rows: &[HistoryRow<A>],
    current: Option<&CurrentRecord<A>>,
) -> Vec<TimelineIssue> {
    let mut issues = Vec::new();
    let issue = |severity: Severity, at: DateTime<Utc>, text: String| TimelineIssue {
        generation,
        severity,
        at,
        issue: text,
    };

    for (i, row) in rows.iter().enumerate() {
        let is_last = i + 1 == rows.len();

        match row.valid_until {
            None if is_last && current.is_none() => issues.push(issue(
                Severity::Warning,
                row.valid_since,
                "final history row was never closed".to_string(),
            )),
            None => issues.push(issue(
                Severity::Critical,
                row.valid_since,
                "history row is open but has a successor".to_string(),
            )),
            Some(until) if until <= row.valid_since => issues.push(issue(
                Severity::Critical,
                row.valid_since,
                format!("empty or inverted interval (ends {})", until),
            )),
            Some(_) => {}
        }

        if let Some(next) = rows.get(i + 1) {
            if next.valid_since <= row.valid_since {
                issues.push(issue(
                    Severity::Critical,
                    next.valid_since,
                    "history rows are not ascending".to_string(),
                ));
            }
            if let Some(until) = row.valid_until {
                if until < next.valid_since {
                    issues.push(issue(
                        Severity::Critical,
                        row.valid_since,
                        format!("gap between {} and {}", until, next.valid_since),
                    ));
                } else if until > next.valid_since {
                    issues.push(issue(
                        Severity::Critical,
                        row.valid_since,
                        format!("overlaps next row starting {}", next.valid_since),
                    ));
                }
            }
        }
    }

    if let (Some(last), Some(current)) = (rows.last(), current) {
        if last.valid_until != Some(current.effective_since) {
            issues.push(issue(
                Severity::Critical,
                last.valid_since,
                format!(
                    "last row does not end where current state begins ({})",
                    current.effective_since
                ),
            ));
        }
    }

    issues
}

/// Walk every generation of `id` and report invariant violations.
pub fn verify_timeline<A, B, C>(store: &TemporalStore<A, B, C>, id: &str) -> Result<TimelineReport>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
{
    let latest = store.latest_generation(id)?;
    let current = store.read_record(id).ok();
    let mut issues = Vec::new();
    let mut rows_checked = 0;
    let mut previous_end: Option<DateTime<Utc>> = None;

    for generation in 1..=latest {
        let rows = store
            .read_history_generation(id, generation)
            .collect::<Result<Vec<_>>>()?;
        let open = current.as_ref().filter(|c| c.generation == generation);
        rows_checked += rows.len();

        let start = rows
            .first()
            .map(|r| r.valid_since)
            .or_else(|| open.map(|c| c.effective_since));
        if let (Some(end), Some(start)) = (previous_end, start) {
            if start < end {
                issues.push(TimelineIssue {
                    generation,
                    severity: Severity::Critical,
                    at: start,
                    issue: format!("generation starts before previous one ended ({})", end),
                });
            }
        }

        issues.extend(check_generation(generation, &rows, open));
        previous_end = rows.last().and_then(|r| r.valid_until).or(previous_end);
    }

    for issue in &issues {
        warn!(kind = A::KIND, id, generation = issue.generation, "{}", issue.issue);
    }

    Ok(TimelineReport {
        kind: A::KIND.to_string(),
        id: id.to_string(),
        generations: latest,
        rows_checked,
        issues,
    })
}

// ============================================================================
// CSV EXPORT
// ============================================================================

/// Write every history row of `id` (all generations, oldest first) as CSV.
/// Returns the number of rows written.
pub fn export_history_csv<A, B, C, W>(store: &TemporalStore<A, B, C>, id: &str, writer: W) -> Result<usize>
where
    A: Versioned,
    B: Persistence<A>,
    C: Clock,
    W: Write,
{
    let latest = store.latest_generation(id)?;
    let mut csv = csv::Writer::from_writer(writer);

    let mut header = vec!["id", "generation", "valid_since", "valid_until"];
    header.extend(A::columns().iter().map(|c| c.name));
    csv.write_record(&header)?;

    let mut written = 0;
    for generation in 1..=latest {
        for row in store.read_history_generation(id, generation) {
            let row = row?;
            let mut record = vec![
                row.id.clone(),
                row.generation.to_string(),
                format_timestamp(row.valid_since),
                row.valid_until.map(format_timestamp).unwrap_or_default(),
            ];
            record.extend(row.attrs.field_strings());
            csv.write_record(&record)?;
            written += 1;
        }
    }

    csv.flush()?;
    Ok(written)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::entities::Realtor;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn row(since: i64, until: Option<i64>) -> HistoryRow<&'static str> {
        HistoryRow {
            id: "r1".to_string(),
            valid_since: t(since),
            valid_until: until.map(t),
            generation: 1,
            attrs: "x",
        }
    }

    fn current(since: i64) -> CurrentRecord<&'static str> {
        CurrentRecord {
            id: "r1".to_string(),
            attrs: "y",
            effective_since: t(since),
            generation: 1,
        }
    }

    #[test]
    fn test_contiguous_generation_has_no_issues() {
        let rows = vec![row(0, Some(10)), row(10, Some(20))];
        assert!(check_generation(1, &rows, Some(&current(20))).is_empty());
    }

    #[test]
    fn test_detects_gap_and_overlap() {
        let gap = vec![row(0, Some(10)), row(12, Some(20))];
        let issues = check_generation(1, &gap, None);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].issue.starts_with("gap"));

        let overlap = vec![row(0, Some(15)), row(10, Some(20))];
        let issues = check_generation(1, &overlap, None);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].issue.starts_with("overlaps"));
    }

    #[test]
    fn test_open_rows() {
        let dangling = vec![row(0, Some(10)), row(10, None)];
        let issues = check_generation(1, &dangling, None);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);

        let open_middle = vec![row(0, None), row(10, Some(20))];
        let issues = check_generation(1, &open_middle, None);
        assert_eq!(issues[0].severity, Severity::Critical);
    }

    #[test]
    fn test_last_row_must_meet_current() {
        let rows = vec![row(0, Some(10))];
        let issues = check_generation(1, &rows, Some(&current(11)));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Critical);
    }

    fn realtor_store() -> TemporalStore<Realtor, MemoryBackend<Realtor>, ManualClock> {
        TemporalStore::with_clock(
            Arc::new(MemoryBackend::new()),
            Arc::new(ManualClock::new(t(0))),
        )
        .unwrap()
    }

    #[test]
    fn test_store_written_timeline_verifies_clean() {
        let store = realtor_store();
        store.create_at("r1", Realtor::new("Ana", "Soto", "111"), t(0)).unwrap();
        store.update_at("r1", Realtor::new("Ana", "Soto", "222"), t(10)).unwrap();
        store.delete_at("r1", t(20)).unwrap();
        store.create_at("r1", Realtor::new("Ana", "Soto", "333"), t(20)).unwrap();

        let report = verify_timeline(&store, "r1").unwrap();
        assert!(report.is_consistent(), "{}", report.summary());
        assert_eq!(report.generations, 2);
        assert_eq!(report.rows_checked, 2);
    }

    #[test]
    fn test_export_history_csv() {
        let store = realtor_store();
        store
            .create_at("r1", Realtor::new("Ana", "Soto", "111").with_user("u1"), t(0))
            .unwrap();
        store.update_at("r1", Realtor::new("Ana", "Soto", "222"), t(10)).unwrap();

        let mut out = Vec::new();
        let written = export_history_csv(&store, "r1", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(written, 1);
        assert_eq!(
            lines[0],
            "id,generation,valid_since,valid_until,first_name,last_name,phone,user_id"
        );
        assert_eq!(
            lines[1],
            "r1,1,2024-01-01T00:00:00.000000Z,2024-01-01T00:00:10.000000Z,Ana,Soto,111,u1"
        );
    }
}
