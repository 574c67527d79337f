//! SQL Agent
//!
//! One agent per domain: it owns the domain's schema context, a synthesizer,
//! the repair loop and the warehouse connection. Requests are processed one
//! at a time (`&mut self`), so the connection is never shared mid-session.

use crate::config::{AgentSettings, AppConfig, CredentialRegistry, SQL_AGENT_LLM};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::execution_loop::{RepairLoop, RepairOutcome};
use crate::executor::QueryResult;
use crate::llm::{LlmBackend, LlmClient};
use crate::schema::SchemaContext;
use crate::synthesizer::SqlSynthesizer;
use crate::warehouse::{ConfiguredDriver, WarehouseDriver};
use std::sync::Arc;
use tracing::info;

pub struct SqlAgent {
    name: String,
    description: String,
    schema: Arc<SchemaContext>,
    synthesizer: SqlSynthesizer,
    repair_loop: RepairLoop,
    connections: ConnectionManager,
}

impl SqlAgent {
    pub fn new(
        name: impl Into<String>,
        schema: Arc<SchemaContext>,
        llm: Arc<dyn LlmBackend>,
        driver: Arc<dyn WarehouseDriver>,
        credentials: Arc<CredentialRegistry>,
    ) -> Self {
        let name = name.into();
        let connections = ConnectionManager::new(&name, driver, credentials);
        info!(domain = connections.domain_key(), "Initializing {}", name);
        Self {
            description: format!("{} agent with text-to-SQL capabilities", name),
            name,
            schema,
            synthesizer: SqlSynthesizer::new(llm),
            repair_loop: RepairLoop::default(),
            connections,
        }
    }

    pub fn with_settings(mut self, settings: &AgentSettings) -> Self {
        self.repair_loop = RepairLoop::new(settings.max_attempts, settings.abort_on_repeat_error);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Agent for a configured domain, talking to the configured model backend
    /// and to whichever warehouse kind the domain's credentials name.
    pub fn from_config(config: &AppConfig, domain_key: &str) -> Result<Self> {
        let schema = config.schema_context(domain_key)?;
        let llm = LlmClient::new(config.llm_for(SQL_AGENT_LLM).clone())?;
        let mut agent = Self::new(
            config.agent_name(domain_key),
            schema,
            Arc::new(llm),
            Arc::new(ConfiguredDriver),
            Arc::new(config.warehouse.clone()),
        )
        .with_settings(&config.agent);
        if let Some(description) = config.domain(domain_key)?.description.clone() {
            agent = agent.with_description(description);
        }
        Ok(agent)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn domain_key(&self) -> &str {
        self.connections.domain_key()
    }

    pub fn schema(&self) -> &Arc<SchemaContext> {
        &self.schema
    }

    pub fn max_attempts(&self) -> u32 {
        self.repair_loop.max_attempts()
    }

    pub fn is_connected(&self) -> bool {
        self.connections.is_connected()
    }

    /// Natural-language question in, full result set out
    pub async fn process(&mut self, text: &str) -> Result<QueryResult> {
        Ok(self.process_with_trail(text).await?.result)
    }

    /// Same as [`process`](Self::process), keeping every attempt's record
    pub async fn process_with_trail(&mut self, text: &str) -> Result<RepairOutcome> {
        info!(agent = %self.name, "Processing natural language query: {}", text);
        let outcome = self
            .repair_loop
            .run(&self.synthesizer, &self.schema, text, &mut self.connections)
            .await?;
        info!(
            agent = %self.name,
            "Query answered after {} attempt(s) with {} rows",
            outcome.attempts.len(),
            outcome.result.row_count()
        );
        Ok(outcome)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.connections.close().await
    }
}
