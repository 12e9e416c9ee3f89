// 🗄️ SQLite backend
//
// One connection, one table pair per versioned kind:
//   <kind>          id PK, <attrs>, effective_since, generation
//   <kind>_history  (id, valid_since) PK, valid_until, <attrs>, generation
//
// Transitions run in BEGIN IMMEDIATE transactions so that the CAS check,
// the history append and the current-record write commit together. Other
// processes sharing the file are serialized by SQLite's write lock.

use super::{Persistence, Transition};
use crate::error::{Result, VersioningError};
use crate::temporal::{format_timestamp, parse_timestamp, CurrentRecord, HistoryRow};
use crate::versioned::{column_list, Versioned};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) a database file with WAL journaling.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for crash recovery
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(busy_timeout)?;

        debug!(path = %path.as_ref().display(), "opened sqlite backend");
        Ok(SqliteBackend {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteBackend {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| VersioningError::LockPoisoned)
    }
}

// ============================================================================
// ROW DECODING
// ============================================================================

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        parse_timestamp(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// `SELECT id, effective_since, generation, <attrs>`
fn current_from_row<A: Versioned>(row: &Row<'_>) -> rusqlite::Result<CurrentRecord<A>> {
    Ok(CurrentRecord {
        id: row.get(0)?,
        effective_since: timestamp_at(row, 1)?,
        generation: row.get(2)?,
        attrs: A::from_sql_row(row, 3)?,
    })
}

/// `SELECT id, valid_since, valid_until, generation, <attrs>`
fn history_from_row<A: Versioned>(row: &Row<'_>) -> rusqlite::Result<HistoryRow<A>> {
    Ok(HistoryRow {
        id: row.get(0)?,
        valid_since: timestamp_at(row, 1)?,
        valid_until: optional_timestamp_at(row, 2)?,
        generation: row.get(3)?,
        attrs: A::from_sql_row(row, 4)?,
    })
}

fn current_select<A: Versioned>() -> String {
    format!(
        "SELECT id, effective_since, generation, {} FROM {}",
        column_list::<A>(),
        A::TABLE
    )
}

fn history_select<A: Versioned>() -> String {
    format!(
        "SELECT id, valid_since, valid_until, generation, {} FROM {}",
        column_list::<A>(),
        A::HISTORY_TABLE
    )
}

/// `?start, ?start+1, ...` for `count` placeholders.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_current<A: Versioned>(conn: &Connection, id: &str) -> Result<Option<CurrentRecord<A>>> {
    let sql = format!("{} WHERE id = ?1", current_select::<A>());
    Ok(conn
        .query_row(&sql, params![id], current_from_row::<A>)
        .optional()?)
}

fn select_last_history<A: Versioned>(conn: &Connection, id: &str) -> Result<Option<HistoryRow<A>>> {
    let sql = format!(
        "{} WHERE id = ?1 ORDER BY valid_since DESC LIMIT 1",
        history_select::<A>()
    );
    Ok(conn
        .query_row(&sql, params![id], history_from_row::<A>)
        .optional()?)
}

fn insert_history<A: Versioned>(conn: &Connection, row: &HistoryRow<A>) -> Result<()> {
    let columns = A::columns();
    let sql = format!(
        "INSERT INTO {} (id, valid_since, valid_until, generation, {}) VALUES (?1, ?2, ?3, ?4, {})",
        A::HISTORY_TABLE,
        column_list::<A>(),
        placeholders(5, columns.len())
    );

    let mut values = vec![
        Value::Text(row.id.clone()),
        Value::Text(format_timestamp(row.valid_since)),
        row.valid_until
            .map_or(Value::Null, |until| Value::Text(format_timestamp(until))),
        Value::Integer(i64::from(row.generation)),
    ];
    values.extend(row.attrs.to_sql_values());

    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

// ============================================================================
// PERSISTENCE
// ============================================================================

impl<A: Versioned> Persistence<A> for SqliteBackend {
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        let attr_ddl = A::columns()
            .iter()
            .map(|c| c.ddl())
            .collect::<Vec<_>>()
            .join(",\n                ");

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                {attrs},
                effective_since TEXT NOT NULL,
                generation INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {history} (
                id TEXT NOT NULL,
                valid_since TEXT NOT NULL,
                valid_until TEXT,
                {attrs},
                generation INTEGER NOT NULL,
                PRIMARY KEY (id, valid_since),
                CHECK (valid_until IS NULL OR valid_until > valid_since)
            );

            -- Paging one generation in order
            CREATE INDEX IF NOT EXISTS idx_{kind}_history_generation
                ON {history}(id, generation, valid_since);
            "#,
            table = A::TABLE,
            history = A::HISTORY_TABLE,
            attrs = attr_ddl,
            kind = A::KIND,
        ))?;

        debug!(kind = A::KIND, "schema ready");
        Ok(())
    }

    fn insert_current(&self, id: &str, attrs: &A, at: DateTime<Utc>) -> Result<CurrentRecord<A>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if select_current::<A>(&tx, id)?.is_some() {
            return Err(VersioningError::already_exists(A::KIND, id));
        }

        let generation = match select_last_history::<A>(&tx, id)? {
            Some(last) => {
                let closed_at = last.valid_until.unwrap_or(last.valid_since);
                if at < closed_at {
                    return Err(VersioningError::invalid_timestamp(
                        A::KIND,
                        id,
                        at,
                        format!("previous lifetime ended at {}", closed_at),
                    ));
                }
                last.generation + 1
            }
            None => 1,
        };

        let columns = A::columns();
        let sql = format!(
            "INSERT INTO {} (id, effective_since, generation, {}) VALUES (?1, ?2, ?3, {})",
            A::TABLE,
            column_list::<A>(),
            placeholders(4, columns.len())
        );
        let mut values = vec![
            Value::Text(id.to_string()),
            Value::Text(format_timestamp(at)),
            Value::Integer(i64::from(generation)),
        ];
        values.extend(attrs.to_sql_values());
        tx.execute(&sql, params_from_iter(values))?;
        tx.commit()?;

        Ok(CurrentRecord {
            id: id.to_string(),
            attrs: attrs.clone(),
            effective_since: at,
            generation,
        })
    }

    fn load_current(&self, id: &str) -> Result<Option<CurrentRecord<A>>> {
        let conn = self.lock()?;
        select_current::<A>(&conn, id)
    }

    fn commit_transition(
        &self,
        id: &str,
        expected_since: DateTime<Utc>,
        transition: Transition<A>,
    ) -> Result<HistoryRow<A>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = select_current::<A>(&tx, id)?
            .ok_or_else(|| VersioningError::not_found(A::KIND, id))?;
        if current.effective_since != expected_since {
            return Err(VersioningError::conflict(A::KIND, id, expected_since));
        }

        let closed = HistoryRow {
            id: id.to_string(),
            valid_since: current.effective_since,
            valid_until: Some(transition.at()),
            generation: current.generation,
            attrs: current.attrs,
        };
        insert_history(&tx, &closed)?;

        let expected = format_timestamp(expected_since);
        let changed = match transition {
            Transition::Replace { attrs, at } => {
                let columns = A::columns();
                let assignments = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = ?{}", c.name, i + 4))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {} SET effective_since = ?1, {} WHERE id = ?2 AND effective_since = ?3",
                    A::TABLE,
                    assignments
                );
                let mut values = vec![
                    Value::Text(format_timestamp(at)),
                    Value::Text(id.to_string()),
                    Value::Text(expected),
                ];
                values.extend(attrs.to_sql_values());
                tx.execute(&sql, params_from_iter(values))?
            }
            Transition::Remove { .. } => tx.execute(
                &format!(
                    "DELETE FROM {} WHERE id = ?1 AND effective_since = ?2",
                    A::TABLE
                ),
                params![id, expected],
            )?,
        };

        // Dropping `tx` without commit rolls the history append back
        if changed != 1 {
            return Err(VersioningError::conflict(A::KIND, id, expected_since));
        }
        tx.commit()?;

        Ok(closed)
    }

    fn history_page(
        &self,
        id: &str,
        generation: u32,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<HistoryRow<A>>> {
        let conn = self.lock()?;
        let sql = format!(
            "{} WHERE id = ?1 AND generation = ?2 AND valid_since > ?3 ORDER BY valid_since ASC LIMIT ?4",
            history_select::<A>()
        );
        // Every stored timestamp sorts after the empty string
        let lower = after.map(format_timestamp).unwrap_or_default();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![id, generation, lower, limit], history_from_row::<A>)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn history_at(&self, id: &str, time: DateTime<Utc>) -> Result<Option<HistoryRow<A>>> {
        let conn = self.lock()?;
        let sql = format!(
            "{} WHERE id = ?1 AND valid_since <= ?2 AND (valid_until IS NULL OR valid_until > ?2)
             ORDER BY valid_since DESC LIMIT 1",
            history_select::<A>()
        );
        Ok(conn
            .query_row(&sql, params![id, format_timestamp(time)], history_from_row::<A>)
            .optional()?)
    }

    fn last_history_row(&self, id: &str) -> Result<Option<HistoryRow<A>>> {
        let conn = self.lock()?;
        select_last_history::<A>(&conn, id)
    }

    fn known_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id FROM {} UNION SELECT id FROM {} ORDER BY id",
            A::TABLE,
            A::HISTORY_TABLE
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
