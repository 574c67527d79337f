//! Query Executor
//!
//! Runs one vetted statement on an open connection and normalizes the result.
//! One call is one execution attempt; nothing is retried here.

use crate::error::{AgentError, Result};
use crate::warehouse::{Cursor, WarehouseConnection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

/// Columns in driver descriptor order, rows in warehouse return order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as column-name keyed objects
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExecutor;

impl QueryExecutor {
    pub fn new() -> Self {
        Self
    }

    /// The statement handle is released whether or not the statement succeeds.
    pub async fn execute(
        &self,
        connection: &mut dyn WarehouseConnection,
        sql: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<QueryResult> {
        info!("Executing SQL query (attempt {}/{}): {}", attempt, max_attempts, sql);

        let mut cursor = connection.cursor()?;
        let outcome = run_statement(cursor.as_mut(), sql).await;
        if let Err(e) = cursor.close().await {
            warn!("Failed to release statement handle: {}", e);
        }

        match outcome {
            Ok(result) => {
                info!("Query executed successfully, returned {} rows", result.row_count());
                Ok(result)
            }
            Err(e) => {
                error!("Failed to execute query (attempt {}/{}): {}", attempt, max_attempts, e);
                Err(e)
            }
        }
    }
}

async fn run_statement(cursor: &mut dyn Cursor, sql: &str) -> Result<QueryResult> {
    cursor.execute(sql).await?;
    let rows = cursor.fetch_all().await?;
    let columns: Vec<String> = cursor
        .description()
        .map(|desc| desc.into_iter().map(|c| c.name).collect())
        .unwrap_or_default();
    normalize(columns, rows)
}

fn normalize(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<QueryResult> {
    if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
        return Err(AgentError::execution(format!(
            "malformed result set: row {} has {} values but the descriptor has {} columns",
            idx,
            row.len(),
            columns.len()
        )));
    }
    Ok(QueryResult { columns, rows })
}
