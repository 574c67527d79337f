//! Warehouse driver contract
//!
//! The executor only needs connect, a statement handle (cursor) that runs one
//! statement and exposes its rows and result descriptor, and close. Drivers
//! report statement failures as execution errors and connection failures as
//! connection errors.

pub mod postgres;
pub mod snowflake;

use crate::config::{CredentialSet, WarehouseKind};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use postgres::PostgresDriver;
pub use snowflake::SnowflakeDriver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_name: Option<String>,
}

impl ColumnDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
        }
    }
}

#[async_trait]
pub trait WarehouseDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, credentials: &CredentialSet) -> Result<Box<dyn WarehouseConnection>>;
}

#[async_trait]
pub trait WarehouseConnection: Send {
    /// Open a statement handle
    fn cursor(&mut self) -> Result<Box<dyn Cursor>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Cursor: Send {
    /// Run one statement; rows are buffered for `fetch_all`
    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn fetch_all(&mut self) -> Result<Vec<Vec<serde_json::Value>>>;

    /// Result descriptor of the last statement, if it produced one
    fn description(&self) -> Option<Vec<ColumnDescriptor>>;

    async fn close(&mut self) -> Result<()>;
}

/// Largest count of significant digits an f64 carries exactly
const F64_DIGITS: usize = 15;

/// Decimal text as a JSON number when f64 holds it exactly, else as the
/// original string
pub(crate) fn decimal_value(text: String) -> serde_json::Value {
    let digits = text.trim_start_matches(['-', '+']);
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let significant = format!("{}{}", int_part, frac_part.trim_end_matches('0'));
    let significant = significant.trim_start_matches('0');

    if significant.len() > F64_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return serde_json::Value::String(text);
    }
    match text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        Some(n) => serde_json::Value::Number(n),
        None => serde_json::Value::String(text),
    }
}

/// Driver for a credential set's warehouse kind
pub fn driver_for(kind: WarehouseKind) -> Arc<dyn WarehouseDriver> {
    match kind {
        WarehouseKind::Snowflake => Arc::new(SnowflakeDriver::new()),
        WarehouseKind::Postgres => Arc::new(PostgresDriver::new()),
    }
}

/// Dispatches on the `kind` of whichever credentials the domain resolves to
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredDriver;

#[async_trait]
impl WarehouseDriver for ConfiguredDriver {
    fn name(&self) -> &'static str {
        "configured"
    }

    async fn connect(&self, credentials: &CredentialSet) -> Result<Box<dyn WarehouseConnection>> {
        driver_for(credentials.kind).connect(credentials).await
    }
}
