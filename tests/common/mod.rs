#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use warehouse_sql_agent::config::{CredentialRegistry, CredentialSet};
use warehouse_sql_agent::error::{AgentError, Result};
use warehouse_sql_agent::llm::{ChatMessage, LlmBackend};
use warehouse_sql_agent::schema::SchemaContext;
use warehouse_sql_agent::warehouse::{
    ColumnDescriptor, Cursor, WarehouseConnection, WarehouseDriver,
};
use warehouse_sql_agent::SqlAgent;

pub const ORG_SCHEMA: &str =
    "Schema: CORE\nTables: organization_name_latest, organization_address_latest";

pub fn fenced(sql: &str) -> String {
    format!("Here you go:\n```sql\n{}\n```", sql)
}

/// Model backend answering from a script and recording every prompt
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new<I>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = std::result::Result<String, String>>,
    {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn answering<I, S>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(responses.into_iter().map(|r| Ok(r.into())))
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, index: usize) -> String {
        self.prompts.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn ask(&self, messages: &[ChatMessage]) -> Result<String> {
        let prompt = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        self.prompts.lock().unwrap().push(prompt);
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(AgentError::Synthesis(e)),
            None => Err(AgentError::Synthesis("script exhausted".to_string())),
        }
    }
}

pub enum Scripted {
    Rows(Vec<&'static str>, Vec<Vec<Value>>),
    Fail(&'static str),
    /// The session is gone by the time the statement arrives
    Disconnect(&'static str),
}

#[derive(Default)]
pub struct WarehouseState {
    script: Mutex<VecDeque<Scripted>>,
    repeat_last: Mutex<Option<&'static str>>,
    pub fail_connect: Mutex<Option<&'static str>>,
    pub connects: AtomicUsize,
    pub executes: AtomicUsize,
    pub cursor_closes: AtomicUsize,
    pub connection_closes: AtomicUsize,
    pub executed_sql: Mutex<Vec<String>>,
}

impl WarehouseState {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn cursor_closes(&self) -> usize {
        self.cursor_closes.load(Ordering::SeqCst)
    }

    pub fn connection_closes(&self) -> usize {
        self.connection_closes.load(Ordering::SeqCst)
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed_sql.lock().unwrap().clone()
    }
}

/// Warehouse driver returning scripted results
#[derive(Clone, Default)]
pub struct StubDriver {
    pub state: Arc<WarehouseState>,
}

impl StubDriver {
    pub fn scripted<I: IntoIterator<Item = Scripted>>(script: I) -> Self {
        let driver = Self::default();
        *driver.state.script.lock().unwrap() = script.into_iter().collect();
        driver
    }

    /// Every statement fails with the same message
    pub fn always_failing(message: &'static str) -> Self {
        let driver = Self::default();
        *driver.state.repeat_last.lock().unwrap() = Some(message);
        driver
    }

    pub fn refusing_connections(message: &'static str) -> Self {
        let driver = Self::default();
        *driver.state.fail_connect.lock().unwrap() = Some(message);
        driver
    }
}

#[async_trait]
impl WarehouseDriver for StubDriver {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn connect(&self, _credentials: &CredentialSet) -> Result<Box<dyn WarehouseConnection>> {
        if let Some(message) = *self.state.fail_connect.lock().unwrap() {
            return Err(AgentError::Connection(message.to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubConnection {
            state: self.state.clone(),
        }))
    }
}

struct StubConnection {
    state: Arc<WarehouseState>,
}

#[async_trait]
impl WarehouseConnection for StubConnection {
    fn cursor(&mut self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(StubCursor {
            state: self.state.clone(),
            columns: None,
            rows: Vec::new(),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.state.connection_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StubCursor {
    state: Arc<WarehouseState>,
    columns: Option<Vec<ColumnDescriptor>>,
    rows: Vec<Vec<Value>>,
}

#[async_trait]
impl Cursor for StubCursor {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        self.state.executed_sql.lock().unwrap().push(sql.to_string());

        if let Some(message) = *self.state.repeat_last.lock().unwrap() {
            return Err(AgentError::execution(message));
        }
        match self.state.script.lock().unwrap().pop_front() {
            Some(Scripted::Rows(columns, rows)) => {
                self.columns = Some(columns.into_iter().map(ColumnDescriptor::named).collect());
                self.rows = rows;
                Ok(())
            }
            Some(Scripted::Fail(message)) => Err(AgentError::execution(message)),
            Some(Scripted::Disconnect(message)) => Err(AgentError::Connection(message.to_string())),
            None => Err(AgentError::execution("no scripted result")),
        }
    }

    async fn fetch_all(&mut self) -> Result<Vec<Vec<Value>>> {
        Ok(std::mem::take(&mut self.rows))
    }

    fn description(&self) -> Option<Vec<ColumnDescriptor>> {
        self.columns.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.state.cursor_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn default_credentials() -> Arc<CredentialRegistry> {
    let mut registry = CredentialRegistry::new();
    registry.register(
        "default",
        CredentialSet {
            user: "ANALYST".to_string(),
            account: "xy12345".to_string(),
            ..Default::default()
        },
    );
    Arc::new(registry)
}

pub fn org_agent(llm: Arc<ScriptedLlm>, driver: &StubDriver) -> SqlAgent {
    SqlAgent::new(
        "org_authority",
        SchemaContext::new("org", ORG_SCHEMA),
        llm,
        Arc::new(driver.clone()),
        default_credentials(),
    )
}
