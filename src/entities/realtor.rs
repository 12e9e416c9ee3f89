// 🏠 Realtor Entity
//
// "Realtor phone is a VALUE (can change), realtor id is IDENTITY (never changes)"
//
// Listings reference realtors by id, so renaming or re-numbering a realtor
// keeps old listings pointing at the same identity while the history table
// remembers what the contact details were at any point in time.

use crate::versioned::{Column, Versioned};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Versioned attributes of a realtor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realtor {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,

    /// Platform account linked to this realtor, if any
    pub user_id: Option<String>,
}

impl Realtor {
    pub fn new(first_name: &str, last_name: &str, phone: &str) -> Self {
        Realtor {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            phone: phone.to_string(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

const COLUMNS: &[Column] = &[
    Column::required("first_name", "TEXT"),
    Column::required("last_name", "TEXT"),
    Column::required("phone", "TEXT"),
    Column::optional("user_id", "TEXT"),
];

impl Versioned for Realtor {
    const KIND: &'static str = "realtor";
    const TABLE: &'static str = "realtor";
    const HISTORY_TABLE: &'static str = "realtor_history";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn to_sql_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.first_name.clone()),
            Value::Text(self.last_name.clone()),
            Value::Text(self.phone.clone()),
            self.user_id.clone().map_or(Value::Null, Value::Text),
        ]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Realtor {
            first_name: row.get(offset)?,
            last_name: row.get(offset + 1)?,
            phone: row.get(offset + 2)?,
            user_id: row.get(offset + 3)?,
        })
    }
}
