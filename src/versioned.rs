// Versioned kinds
// One trait describes everything the store and its backends need to know
// about an attribute set: where it lives and how it maps to columns.

use rusqlite::types::Value;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// An attribute column of a versioned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    /// SQLite type affinity used in `CREATE TABLE`.
    pub sql_type: &'static str,
    pub nullable: bool,
}

impl Column {
    pub const fn required(name: &'static str, sql_type: &'static str) -> Self {
        Column {
            name,
            sql_type,
            nullable: false,
        }
    }

    pub const fn optional(name: &'static str, sql_type: &'static str) -> Self {
        Column {
            name,
            sql_type,
            nullable: true,
        }
    }

    pub fn ddl(&self) -> String {
        if self.nullable {
            format!("{} {}", self.name, self.sql_type)
        } else {
            format!("{} {} NOT NULL", self.name, self.sql_type)
        }
    }
}

/// Attribute set of an entity kind that keeps a history twin.
///
/// Implementors hold only the versioned attributes: no id, no timestamps.
pub trait Versioned:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name used in errors, logs and URLs (`realtor`).
    const KIND: &'static str;

    /// Table holding the current records (quoted if it is a keyword).
    const TABLE: &'static str;

    /// Append-only history twin.
    const HISTORY_TABLE: &'static str;

    /// Attribute columns, in the order of `to_sql_values` and `from_sql_row`.
    fn columns() -> &'static [Column];

    fn to_sql_values(&self) -> Vec<Value>;

    /// Decode attributes starting at column `offset` of `row`.
    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self>;

    /// Flat text form of each attribute, for CSV export.
    fn field_strings(&self) -> Vec<String> {
        self.to_sql_values()
            .into_iter()
            .map(|value| match value {
                Value::Null => String::new(),
                Value::Integer(n) => n.to_string(),
                Value::Real(f) => f.to_string(),
                Value::Text(s) => s,
                Value::Blob(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
            })
            .collect()
    }
}

/// Comma-separated attribute column names.
pub fn column_list<A: Versioned>() -> String {
    A::columns()
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}
