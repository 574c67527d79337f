//! Snowflake Warehouse Driver
//!
//! Speaks the session REST protocol used by Snowflake's own connectors:
//! - POST /session/v1/login-request with user/password returns a session token
//! - POST /queries/v1/query-request runs one statement
//! - in-progress statements are polled through `getResultUrl`
//! - large results are split into chunks that are downloaded separately
//! - POST /session?delete=true ends the session

use crate::config::CredentialSet;
use crate::error::{AgentError, Result};
use crate::warehouse::{
    decimal_value, ColumnDescriptor, Cursor, WarehouseConnection, WarehouseDriver,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CLIENT_APP_ID: &str = "warehouse-sql-agent";
const QUERY_IN_PROGRESS: &str = "333333";
const QUERY_IN_PROGRESS_ASYNC: &str = "333334";
/// Session expired, authentication token expired
const SESSION_GONE: [&str; 2] = ["390112", "390114"];
const MAX_POLLS: usize = 1200;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct SnowflakeResponse<T> {
    data: Option<T>,
    code: Option<String>,
    message: Option<String>,
    #[serde(default)]
    success: bool,
}

impl<T> SnowflakeResponse<T> {
    fn failure_text(&self) -> String {
        format!(
            "{} (code: {})",
            self.message.as_deref().unwrap_or("unknown Snowflake error"),
            self.code.as_deref().unwrap_or("none")
        )
    }

    fn session_gone(&self) -> bool {
        self.code.as_deref().map_or(false, |code| SESSION_GONE.contains(&code))
    }

    fn in_progress(&self) -> bool {
        matches!(self.code.as_deref(), Some(QUERY_IN_PROGRESS) | Some(QUERY_IN_PROGRESS_ASYNC))
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    #[serde(default)]
    rowtype: Vec<RowType>,
    #[serde(default)]
    rowset: Vec<Vec<Option<String>>>,
    query_id: Option<String>,
    get_result_url: Option<String>,
    #[serde(default)]
    chunks: Vec<Chunk>,
    chunk_headers: Option<HashMap<String, String>>,
    qrmk: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    scale: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Chunk {
    url: String,
}

/// Base URL for an account, unless the credentials override the host
fn base_url(credentials: &CredentialSet) -> String {
    match credentials.url {
        Some(ref url) => url.trim_end_matches('/').to_string(),
        None => format!("https://{}.snowflakecomputing.com", credentials.account),
    }
}

/// Convert string-encoded rowset values into JSON scalars by column type
fn normalize_rowset(rowtype: &[RowType], rowset: Vec<Vec<Option<String>>>) -> Vec<Vec<Value>> {
    rowset
        .into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .map(|(idx, cell)| match (cell, rowtype.get(idx)) {
                    (None, _) => Value::Null,
                    (Some(text), Some(col)) => normalize_cell(col, text),
                    (Some(text), None) => Value::String(text),
                })
                .collect()
        })
        .collect()
}

fn normalize_cell(col: &RowType, text: String) -> Value {
    match col.column_type.as_str() {
        "fixed" if col.scale.unwrap_or(0) == 0 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "fixed" => decimal_value(text),
        "real" => match text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(text),
        },
        "boolean" => match text.as_str() {
            "1" | "true" | "TRUE" => Value::Bool(true),
            "0" | "false" | "FALSE" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

/// Chunk bodies are comma-separated row arrays without the enclosing brackets
fn parse_chunk(body: &str) -> Result<Vec<Vec<Option<String>>>> {
    serde_json::from_str(&format!("[{}]", body.trim()))
        .map_err(|e| {
            AgentError::execution(format!("Failed to parse Snowflake result chunk: {}", e))
        })
}

pub struct SnowflakeDriver;

impl SnowflakeDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SnowflakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WarehouseDriver for SnowflakeDriver {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    async fn connect(&self, credentials: &CredentialSet) -> Result<Box<dyn WarehouseConnection>> {
        if credentials.account.is_empty() && credentials.url.is_none() {
            return Err(AgentError::Configuration(
                "Snowflake credentials need an account".to_string(),
            ));
        }
        if credentials.user.is_empty() {
            return Err(AgentError::Configuration("Snowflake credentials need a user".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(credentials.login_timeout_secs.max(1) * 5))
            .connect_timeout(Duration::from_secs(credentials.login_timeout_secs.max(1)))
            .build()
            .map_err(|e| {
                AgentError::Connection(format!("Failed to create HTTP client for Snowflake: {}", e))
            })?;

        let base_url = base_url(credentials);
        info!("Connecting to Snowflake account: {}", credentials.account);

        let account_name = credentials.account.split('.').next().unwrap_or_default();
        let body = serde_json::json!({
            "data": {
                "CLIENT_APP_ID": CLIENT_APP_ID,
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
                "ACCOUNT_NAME": account_name,
                "LOGIN_NAME": credentials.user,
                "PASSWORD": credentials.password,
            }
        });

        let mut query: Vec<(&str, String)> = vec![("requestId", Uuid::new_v4().to_string())];
        for (key, value) in [
            ("warehouse", &credentials.warehouse),
            ("databaseName", &credentials.database),
            ("schemaName", &credentials.schema),
        ] {
            if !value.is_empty() {
                query.push((key, value.clone()));
            }
        }
        if let Some(ref role) = credentials.role {
            query.push(("roleName", role.clone()));
        }

        let response = client
            .post(format!("{}/session/v1/login-request", base_url))
            .query(&query)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Connection(format!("Failed to reach Snowflake: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Connection(format!(
                "Snowflake login failed with status {}: {}",
                status, text
            )));
        }

        let login: SnowflakeResponse<LoginData> = response
            .json()
            .await
            .map_err(|e| {
                AgentError::Connection(format!("Failed to parse Snowflake login response: {}", e))
            })?;

        if !login.success {
            return Err(AgentError::Connection(format!(
                "Snowflake login failed: {}",
                login.failure_text()
            )));
        }
        let token = login
            .data
            .and_then(|d| d.token)
            .ok_or_else(|| {
                AgentError::Connection("Snowflake login returned no session token".to_string())
            })?;

        info!("Successfully connected to Snowflake");
        Ok(Box::new(SnowflakeConnection {
            session: Arc::new(Session {
                client,
                base_url,
                token,
                sequence: AtomicU64::new(0),
            }),
            closed: false,
        }))
    }
}

struct Session {
    client: Client,
    base_url: String,
    token: String,
    sequence: AtomicU64,
}

impl Session {
    fn auth_header(&self) -> String {
        format!("Snowflake Token=\"{}\"", self.token)
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http") {
            url.to_string()
        } else {
            format!("{}{}", self.base_url, url)
        }
    }

    async fn read_query_response(
        &self,
        response: reqwest::Response,
    ) -> Result<SnowflakeResponse<QueryData>> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AgentError::Connection("Snowflake rejected the session token".to_string()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::execution(format!(
                "Snowflake request failed with status {}: {}",
                status, text
            )));
        }
        response
            .json()
            .await
            .map_err(|e| {
                AgentError::execution(format!("Failed to parse Snowflake response: {}", e))
            })
    }

    async fn submit(&self, sql: &str) -> Result<QueryData> {
        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let body = serde_json::json!({
            "sqlText": sql,
            "asyncExec": false,
            "sequenceId": sequence_id,
            "querySubmissionTime": chrono::Utc::now().timestamp_millis(),
        });

        let response = self
            .client
            .post(format!("{}/queries/v1/query-request", self.base_url))
            .query(&[("requestId", Uuid::new_v4().to_string())])
            .header("Authorization", self.auth_header())
            .header("Accept", "application/snowflake")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AgentError::execution(format!("Failed to submit Snowflake query: {}", e))
            })?;

        let mut parsed = self.read_query_response(response).await?;

        // Long-running statements come back in progress; poll until done
        let mut polls = 0;
        while parsed.in_progress() {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(AgentError::execution(
                    "Snowflake query did not finish within the polling limit",
                ));
            }
            let result_url = parsed
                .data
                .as_ref()
                .and_then(|d| d.get_result_url.clone())
                .ok_or_else(|| {
                    AgentError::execution("Snowflake query in progress without a result URL")
                })?;
            tokio::time::sleep(POLL_INTERVAL).await;
            debug!("Polling Snowflake result (poll {})", polls);

            let response = self
                .client
                .get(self.absolute(&result_url))
                .header("Authorization", self.auth_header())
                .header("Accept", "application/snowflake")
                .send()
                .await
                .map_err(|e| {
                    AgentError::execution(format!("Failed to poll Snowflake query: {}", e))
                })?;
            parsed = self.read_query_response(response).await?;
        }

        if parsed.session_gone() {
            return Err(AgentError::Connection(format!(
                "Snowflake session ended: {}",
                parsed.failure_text()
            )));
        }
        if !parsed.success {
            return Err(AgentError::execution(parsed.failure_text()));
        }

        let data = parsed.data.unwrap_or_default();
        if let Some(ref query_id) = data.query_id {
            debug!("Snowflake query finished: {}", query_id);
        }
        Ok(data)
    }

    async fn download_chunks(&self, data: &QueryData) -> Result<Vec<Vec<Option<String>>>> {
        let mut rows = Vec::new();
        for (idx, chunk) in data.chunks.iter().enumerate() {
            let mut request = self.client.get(&chunk.url);
            match (&data.chunk_headers, &data.qrmk) {
                (Some(headers), _) => {
                    for (name, value) in headers {
                        request = request.header(name.as_str(), value.as_str());
                    }
                }
                (None, Some(qrmk)) => {
                    request = request
                        .header("x-amz-server-side-encryption-customer-algorithm", "AES256")
                        .header("x-amz-server-side-encryption-customer-key", qrmk.as_str());
                }
                (None, None) => {}
            }

            let response = request
                .send()
                .await
                .map_err(|e| {
                    AgentError::execution(format!(
                        "Failed to download Snowflake result chunk {}: {}",
                        idx, e
                    ))
                })?;
            if !response.status().is_success() {
                return Err(AgentError::execution(format!(
                    "Snowflake result chunk {} failed with status {}",
                    idx,
                    response.status()
                )));
            }
            let body = response
                .text()
                .await
                .map_err(|e| {
                    AgentError::execution(format!(
                        "Failed to read Snowflake result chunk {}: {}",
                        idx, e
                    ))
                })?;
            rows.extend(parse_chunk(&body)?);
        }
        Ok(rows)
    }
}

pub struct SnowflakeConnection {
    session: Arc<Session>,
    closed: bool,
}

#[async_trait]
impl WarehouseConnection for SnowflakeConnection {
    fn cursor(&mut self) -> Result<Box<dyn Cursor>> {
        if self.closed {
            return Err(AgentError::Connection("Snowflake session is closed".to_string()));
        }
        Ok(Box::new(SnowflakeCursor {
            session: Arc::clone(&self.session),
            columns: None,
            rows: None,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self
            .session
            .client
            .post(format!("{}/session", self.session.base_url))
            .query(&[("delete", "true")])
            .header("Authorization", self.session.auth_header())
            .header("Accept", "application/json")
            .send()
            .await;
        if let Err(e) = result {
            warn!("Failed to end Snowflake session cleanly: {}", e);
        }
        Ok(())
    }
}

pub struct SnowflakeCursor {
    session: Arc<Session>,
    columns: Option<Vec<ColumnDescriptor>>,
    rows: Option<Vec<Vec<Value>>>,
}

#[async_trait]
impl Cursor for SnowflakeCursor {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.columns = None;
        self.rows = None;

        let mut data = self.session.submit(sql).await?;
        let mut rowset = std::mem::take(&mut data.rowset);
        if !data.chunks.is_empty() {
            rowset.extend(self.session.download_chunks(&data).await?);
        }

        if !data.rowtype.is_empty() {
            self.columns = Some(
                data.rowtype
                    .iter()
                    .map(|c| ColumnDescriptor {
                        name: c.name.clone(),
                        type_name: Some(c.column_type.clone()),
                    })
                    .collect(),
            );
        }
        self.rows = Some(normalize_rowset(&data.rowtype, rowset));
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
