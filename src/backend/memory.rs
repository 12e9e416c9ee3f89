// In-memory backend
//
// Same contract as the SQLite backend without durability. All tables sit
// behind a single RwLock so every transition is atomic.

use super::{Persistence, Transition};
use crate::error::{Result, VersioningError};
use crate::temporal::{CurrentRecord, HistoryRow};
use crate::versioned::Versioned;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Tables<A> {
    current: BTreeMap<String, CurrentRecord<A>>,
    /// Append-only, ascending by `valid_since` per id.
    history: BTreeMap<String, Vec<HistoryRow<A>>>,
}

pub struct MemoryBackend<A> {
    tables: RwLock<Tables<A>>,
}

impl<A: Versioned> MemoryBackend<A> {
    pub fn new() -> Self {
        MemoryBackend {
            tables: RwLock::new(Tables {
                current: BTreeMap::new(),
                history: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables<A>>> {
        self.tables.read().map_err(|_| VersioningError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables<A>>> {
        self.tables.write().map_err(|_| VersioningError::LockPoisoned)
    }
}

impl<A: Versioned> Default for MemoryBackend<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Versioned> Persistence<A> for MemoryBackend<A> {
    fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    fn insert_current(&self, id: &str, attrs: &A, at: DateTime<Utc>) -> Result<CurrentRecord<A>> {
        let mut tables = self.write()?;

        if tables.current.contains_key(id) {
            return Err(VersioningError::already_exists(A::KIND, id));
        }

        let generation = match tables.history.get(id).and_then(|rows| rows.last()) {
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

        let record = CurrentRecord {
            id: id.to_string(),
            attrs: attrs.clone(),
            effective_since: at,
            generation,
        };
        tables.current.insert(id.to_string(), record.clone());
        Ok(record)
    }

    fn load_current(&self, id: &str) -> Result<Option<CurrentRecord<A>>> {
        Ok(self.read()?.current.get(id).cloned())
    }

    fn commit_transition(
        &self,
        id: &str,
        expected_since: DateTime<Utc>,
        transition: Transition<A>,
    ) -> Result<HistoryRow<A>> {
        let mut tables = self.write()?;

        let current = tables
            .current
            .get(id)
            .cloned()
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

        match transition {
            Transition::Replace { attrs, at } => {
                tables.current.insert(
                    id.to_string(),
                    CurrentRecord {
                        id: id.to_string(),
                        attrs,
                        effective_since: at,
                        generation: current.generation,
                    },
                );
            }
            Transition::Remove { .. } => {
                tables.current.remove(id);
            }
        }
        tables
            .history
            .entry(id.to_string())
            .or_default()
            .push(closed.clone());

        Ok(closed)
    }

    fn history_page(
        &self,
        id: &str,
        generation: u32,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<HistoryRow<A>>> {
        let tables = self.read()?;
        let rows = match tables.history.get(id) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .filter(|row| row.generation == generation)
            .filter(|row| after.map_or(true, |after| row.valid_since > after))
            .take(limit)
            .cloned()
            .collect())
    }

    fn history_at(&self, id: &str, time: DateTime<Utc>) -> Result<Option<HistoryRow<A>>> {
        let tables = self.read()?;
        Ok(tables
            .history
            .get(id)
            .and_then(|rows| rows.iter().rev().find(|row| row.was_valid_at(time)))
            .cloned())
    }

    fn last_history_row(&self, id: &str) -> Result<Option<HistoryRow<A>>> {
        let tables = self.read()?;
        Ok(tables.history.get(id).and_then(|rows| rows.last()).cloned())
    }

    fn known_ids(&self) -> Result<Vec<String>> {
        let tables = self.read()?;
        let ids: BTreeSet<String> = tables
            .current
            .keys()
            .chain(tables.history.keys())
            .cloned()
            .collect();
        Ok(ids.into_iter().collect())
    }
}
