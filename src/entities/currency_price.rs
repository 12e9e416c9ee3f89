// 💱 Currency Price Entity
//
// The entity id is the currency code (the `currency` lookup id).
// Prices are money: exact decimals, persisted as text, never as REAL.

use crate::versioned::{Column, Versioned};
use rust_decimal::Decimal;
use rusqlite::types::{Type, Value};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyPrice {
    /// Serialized as a string so JSON clients never see a float
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

impl CurrencyPrice {
    pub fn new(price: Decimal) -> Self {
        CurrencyPrice { price }
    }

    pub fn parse(text: &str) -> Result<Self, rust_decimal::Error> {
        Decimal::from_str(text.trim()).map(CurrencyPrice::new)
    }
}

const COLUMNS: &[Column] = &[Column::required("price", "TEXT")];

impl Versioned for CurrencyPrice {
    const KIND: &'static str = "currency_price";
    const TABLE: &'static str = "currency_price";
    const HISTORY_TABLE: &'static str = "currency_price_history";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn to_sql_values(&self) -> Vec<Value> {
        vec![Value::Text(self.price.to_string())]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        let text: String = row.get(offset)?;
        Decimal::from_str(&text)
            .map(CurrencyPrice::new)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(offset, Type::Text, Box::new(e)))
    }
}
