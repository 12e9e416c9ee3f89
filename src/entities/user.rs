// 👤 User Entity
//
// Email and role change over time; the user id does not.
// `role` references the `user_role` lookup table by id.

use crate::versioned::{Column, Versioned};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub role: String,
}

impl User {
    pub fn new(email: &str, role: &str) -> Self {
        User {
            email: email.to_string(),
            role: role.to_string(),
        }
    }
}

const COLUMNS: &[Column] = &[
    Column::required("email", "TEXT"),
    Column::required("role", "TEXT"),
];

impl Versioned for User {
    const KIND: &'static str = "user";
    // "user" is reserved in most SQL dialects
    const TABLE: &'static str = "\"user\"";
    const HISTORY_TABLE: &'static str = "user_history";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn to_sql_values(&self) -> Vec<Value> {
        vec![Value::Text(self.email.clone()), Value::Text(self.role.clone())]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(User {
            email: row.get(offset)?,
            role: row.get(offset + 1)?,
        })
    }
}
