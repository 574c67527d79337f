//! PostgreSQL Warehouse Driver
//!
//! Uses a single `sqlx` connection per handle. Column names come from the
//! prepared statement, so an empty result still has a descriptor.

use crate::config::CredentialSet;
use crate::error::{AgentError, Result};
use crate::warehouse::{
    decimal_value, ColumnDescriptor, Cursor, WarehouseConnection, WarehouseDriver,
};
use async_trait::async_trait;
use serde_json::Value;
use rust_decimal::Decimal;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, Statement, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }

    fn connect_options(credentials: &CredentialSet) -> Result<PgConnectOptions> {
        if let Some(ref url) = credentials.url {
            return PgConnectOptions::from_str(url)
                .map_err(|e| AgentError::Configuration(format!("Invalid Postgres URL: {}", e)));
        }
        let host = if credentials.account.is_empty() {
            "localhost"
        } else {
            credentials.account.as_str()
        };
        let mut options = PgConnectOptions::new().host(host).username(&credentials.user);
        if !credentials.password.is_empty() {
            options = options.password(&credentials.password);
        }
        if !credentials.database.is_empty() {
            options = options.database(&credentials.database);
        }
        Ok(options)
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WarehouseDriver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self, credentials: &CredentialSet) -> Result<Box<dyn WarehouseConnection>> {
        let options = Self::connect_options(credentials)?.disable_statement_logging();
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| AgentError::Connection(format!("Failed to connect to Postgres: {}", e)))?;

        if !credentials.schema.is_empty() {
            let schema = credentials.schema.replace('"', "\"\"");
            let set_path = format!("SET search_path TO \"{}\"", schema);
            conn.execute(set_path.as_str())
                .await
                .map_err(|e| AgentError::Connection(format!("Failed to set search_path: {}", e)))?;
        }

        info!("Successfully connected to Postgres");
        Ok(Box::new(PostgresConnection {
            conn: Some(Arc::new(Mutex::new(conn))),
        }))
    }
}

pub struct PostgresConnection {
    conn: Option<Arc<Mutex<PgConnection>>>,
}

#[async_trait]
impl WarehouseConnection for PostgresConnection {
    fn cursor(&mut self) -> Result<Box<dyn Cursor>> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| AgentError::Connection("Postgres connection is closed".to_string()))?;
        Ok(Box::new(PostgresCursor {
            conn: Arc::clone(conn),
            columns: None,
            rows: None,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        // If a cursor still holds the connection it is released when dropped
        if let Some(Ok(conn)) = self.conn.take().map(Arc::try_unwrap) {
            conn.into_inner()
                .close()
                .await
                .map_err(|e| {
                    AgentError::Connection(format!("Failed to close Postgres connection: {}", e))
                })?;
        }
        Ok(())
    }
}

pub struct PostgresCursor {
    conn: Arc<Mutex<PgConnection>>,
    columns: Option<Vec<ColumnDescriptor>>,
    rows: Option<Vec<Vec<Value>>>,
}

#[async_trait]
impl Cursor for PostgresCursor {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.columns = None;
        self.rows = None;

        let mut conn = self.conn.lock().await;
        let statement = (&mut *conn)
            .prepare(sql)
            .await
            .map_err(|e| AgentError::execution(e.to_string()))?;
        let columns: Vec<ColumnDescriptor> = statement
            .columns()
            .iter()
            .map(|c| ColumnDescriptor {
                name: c.name().to_string(),
                type_name: Some(c.type_info().name().to_string()),
            })
            .collect();

        let rows = sqlx::query(sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| AgentError::execution(e.to_string()))?;

        self.rows = Some(rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?);
        if !columns.is_empty() {
            self.columns = Some(columns);
        }
        Ok(())
    }

    async fn fetch_all(&mut self) -> Result<Vec<Vec<Value>>> {
        self.rows
            .take()
            .ok_or_else(|| {
                AgentError::execution("fetch_all called before a statement was executed")
            })
    }

    fn description(&self) -> Option<Vec<ColumnDescriptor>> {
        self.columns.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.columns = None;
        self.rows = None;
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| decode_cell(row, idx, col.name(), col.type_info().name()))
        .collect()
}

/// How a Postgres column is turned into a JSON value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Json,
    Date,
    Time,
    Timestamp,
    Timestamptz,
    Interval,
    Uuid,
    Text,
    TextArray,
    Int4Array,
    Int8Array,
    Float8Array,
    NumericArray,
    BoolArray,
    /// Anything else: read the raw bytes as UTF-8 when possible
    Raw,
}

impl CellKind {
    fn for_type(type_name: &str) -> Self {
        match type_name {
            "BOOL" => CellKind::Bool,
            "INT2" => CellKind::Int2,
            "INT4" => CellKind::Int4,
            "INT8" => CellKind::Int8,
            "OID" => CellKind::Oid,
            "FLOAT4" => CellKind::Float4,
            "FLOAT8" => CellKind::Float8,
            "NUMERIC" | "MONEY" => CellKind::Numeric,
            "JSON" | "JSONB" => CellKind::Json,
            "DATE" => CellKind::Date,
            "TIME" => CellKind::Time,
            "TIMESTAMP" => CellKind::Timestamp,
            "TIMESTAMPTZ" => CellKind::Timestamptz,
            "INTERVAL" => CellKind::Interval,
            "UUID" => CellKind::Uuid,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => CellKind::Text,
            "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => CellKind::TextArray,
            "INT4[]" => CellKind::Int4Array,
            "INT8[]" => CellKind::Int8Array,
            "FLOAT8[]" => CellKind::Float8Array,
            "NUMERIC[]" => CellKind::NumericArray,
            "BOOL[]" => CellKind::BoolArray,
            _ => CellKind::Raw,
        }
    }
}

fn decode_cell(row: &PgRow, idx: usize, name: &str, type_name: &str) -> Result<Value> {
    let value = match CellKind::for_type(type_name) {
        CellKind::Bool => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::Bool)),
        CellKind::Int2 => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(Value::from)),
        CellKind::Int4 => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(Value::from)),
        CellKind::Int8 => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from)),
        CellKind::Oid => row
            .try_get::<Option<Oid>, _>(idx)
            .map(|v| v.map(|oid| Value::from(oid.0))),
        CellKind::Float4 => row
            .try_get::<Option<f32>, _>(idx)
            .map(|v| v.map(|f| serde_json::json!(f))),
        CellKind::Float8 => row
            .try_get::<Option<f64>, _>(idx)
            .map(|v| v.map(|f| serde_json::json!(f))),
        CellKind::Numeric => row
            .try_get::<Option<Decimal>, _>(idx)
            .map(|v| v.map(|d| decimal_value(d.to_string()))),
        CellKind::Json => row.try_get::<Option<Value>, _>(idx),
        CellKind::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        CellKind::Time => row
            .try_get::<Option<chrono::NaiveTime>, _>(idx)
            .map(|v| v.map(|t| Value::String(t.to_string()))),
        CellKind::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        CellKind::Timestamptz => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.to_rfc3339()))),
        CellKind::Interval => row
            .try_get::<Option<PgInterval>, _>(idx)
            .map(|v| v.map(|i| Value::String(format_interval(&i)))),
        CellKind::Uuid => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| v.map(|u| Value::String(u.to_string()))),
        CellKind::Text => row.try_get::<Option<String>, _>(idx).map(|v| v.map(Value::String)),
        CellKind::TextArray => row
            .try_get::<Option<Vec<String>>, _>(idx)
            .map(|v| v.map(Value::from)),
        CellKind::Int4Array => row
            .try_get::<Option<Vec<i32>>, _>(idx)
            .map(|v| v.map(Value::from)),
        CellKind::Int8Array => row
            .try_get::<Option<Vec<i64>>, _>(idx)
            .map(|v| v.map(Value::from)),
        CellKind::Float8Array => row.try_get::<Option<Vec<f64>>, _>(idx).map(|v| {
            v.map(|items| items.into_iter().map(|f| serde_json::json!(f)).collect::<Value>())
        }),
        CellKind::NumericArray => row.try_get::<Option<Vec<Decimal>>, _>(idx).map(|v| {
            v.map(|items| {
                items
                    .into_iter()
                    .map(|d| decimal_value(d.to_string()))
                    .collect::<Value>()
            })
        }),
        CellKind::BoolArray => row
            .try_get::<Option<Vec<bool>>, _>(idx)
            .map(|v| v.map(Value::from)),
        CellKind::Raw => return decode_raw(row, idx, name, type_name),
    };

    value.map(|v| v.unwrap_or(Value::Null)).map_err(|e| {
        AgentError::execution(format!(
            "cannot decode column '{}' of type {} ({}); cast it to text in the query",
            name, type_name, e
        ))
    })
}

/// Types without a dedicated decoder keep their wire bytes when they are text
fn decode_raw(row: &PgRow, idx: usize, name: &str, type_name: &str) -> Result<Value> {
    let raw = row
        .try_get_raw(idx)
        .map_err(|e| AgentError::execution(format!("cannot read column '{}': {}", name, e)))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    match raw.as_bytes().map(std::str::from_utf8) {
        Ok(Ok(text)) if !text.contains('\0') => Ok(Value::String(text.to_string())),
        _ => Err(AgentError::execution(format!(
            "cannot decode column '{}' of type {}; cast it to text in the query",
            name, type_name
        ))),
    }
}

/// Postgres-style interval text, e.g. `1 mon 2 days 03:04:05`
fn format_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    if interval.months != 0 {
        parts.push(format!("{} mon", interval.months));
    }
    if interval.days != 0 {
        parts.push(format!("{} days", interval.days));
    }
    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let secs = total / 1_000_000;
        let frac = total % 1_000_000;
        let (hours, minutes, seconds) = (secs / 3600, (secs / 60) % 60, secs % 60);
        let mut clock = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
        if frac != 0 {
            clock.push_str(format!(".{:06}", frac).trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_from_fields() {
        let creds = CredentialSet {
            user: "analyst".to_string(),
            database: "authority".to_string(),
            ..Default::default()
        };
        let options = PostgresDriver::connect_options(&creds).unwrap();
        assert_eq!(options.get_host(), "localhost");
        assert_eq!(options.get_username(), "analyst");
        assert_eq!(options.get_database(), Some("authority"));
    }

    #[test]
    fn test_numeric_and_temporal_types_have_decoders() {
        assert_eq!(CellKind::for_type("NUMERIC"), CellKind::Numeric);
        assert_eq!(CellKind::for_type("TIME"), CellKind::Time);
        assert_eq!(CellKind::for_type("INTERVAL"), CellKind::Interval);
        assert_eq!(CellKind::for_type("NUMERIC[]"), CellKind::NumericArray);
        assert_eq!(CellKind::for_type("TEXT[]"), CellKind::TextArray);
        assert_eq!(CellKind::for_type("VARCHAR"), CellKind::Text);
        assert_eq!(CellKind::for_type("INET"), CellKind::Raw);
    }

    #[test]
    fn test_interval_text() {
        let interval = PgInterval {
            months: 14,
            days: 3,
            microseconds: 3_723_500_000,
        };
        assert_eq!(format_interval(&interval), "14 mon 3 days 01:02:03.5");
        let zero = PgInterval {
            months: 0,
            days: 0,
            microseconds: 0,
        };
        assert_eq!(format_interval(&zero), "00:00:00");
        let negative = PgInterval {
            months: 0,
            days: 0,
            microseconds: -90_000_000,
        };
        assert_eq!(format_interval(&negative), "-00:01:30");
    }

    #[test]
    fn test_invalid_url_is_configuration_error() {
        let creds = CredentialSet {
            url: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            PostgresDriver::connect_options(&creds),
            Err(AgentError::Configuration(_))
        ));
    }
}
