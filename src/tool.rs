//! Warehouse tool
//!
//! Facade for a tool-calling layer: routes a natural-language query to the
//! agent of the requested domain and describes itself as a function schema.

use crate::agent::SqlAgent;
use crate::config::AppConfig;
use crate::error::{AgentError, Result};
use crate::executor::QueryResult;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const TOOL_NAME: &str = "snowflake";
pub const DEFAULT_AGENT_TYPE: &str = "org";

type AgentFactory = Box<dyn Fn(&str) -> Result<SqlAgent> + Send + Sync>;

#[derive(Debug, Deserialize)]
pub struct ToolArguments {
    pub query: String,
    #[serde(default)]
    pub agent_type: Option<String>,
}

pub struct WarehouseTool {
    agents: BTreeMap<String, Mutex<Option<SqlAgent>>>,
    factory: AgentFactory,
}

impl WarehouseTool {
    /// `factory` builds the agent for a domain key on first use
    pub fn new<I, S, F>(domain_keys: I, factory: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&str) -> Result<SqlAgent> + Send + Sync + 'static,
    {
        info!("Initializing warehouse tool");
        Self {
            agents: domain_keys
                .into_iter()
                .map(|k| (k.into(), Mutex::new(None)))
                .collect(),
            factory: Box::new(factory),
        }
    }

    pub fn from_config(config: Arc<AppConfig>) -> Self {
        let keys: Vec<String> = config.domain_keys().map(str::to_string).collect();
        Self::new(keys, move |key| SqlAgent::from_config(&config, key))
    }

    pub fn agent_types(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    fn default_agent_type(&self) -> &str {
        if self.agents.contains_key(DEFAULT_AGENT_TYPE) {
            DEFAULT_AGENT_TYPE
        } else {
            self.agents.keys().next().map(String::as_str).unwrap_or(DEFAULT_AGENT_TYPE)
        }
    }

    pub async fn execute(&self, query: &str, agent_type: Option<&str>) -> Result<QueryResult> {
        let agent_type = agent_type.unwrap_or_else(|| self.default_agent_type());
        let slot = self.agents.get(agent_type).ok_or_else(|| {
            AgentError::Configuration(format!(
                "Invalid agent type: {}. Must be one of: {}",
                agent_type,
                self.agent_types().join(", ")
            ))
        })?;

        let mut guard = slot.lock().await;
        if guard.is_none() {
            info!("Creating new agent instance for '{}'", agent_type);
            *guard = Some((self.factory)(agent_type)?);
        }
        let agent = match guard.as_mut() {
            Some(agent) => agent,
            None => {
                return Err(AgentError::Configuration(format!(
                    "agent '{}' unavailable",
                    agent_type
                )))
            }
        };

        info!("Executing warehouse query using {} agent: {}", agent_type, query);
        match agent.process(query).await {
            Ok(result) => {
                info!("Warehouse query executed successfully");
                Ok(result)
            }
            Err(e) => {
                error!("Error executing warehouse query: {}", e);
                Err(e)
            }
        }
    }

    /// Entry point for a function call carrying JSON arguments
    pub async fn execute_json(&self, arguments: &serde_json::Value) -> Result<serde_json::Value> {
        let args: ToolArguments = serde_json::from_value(arguments.clone())?;
        let result = self.execute(&args.query, args.agent_type.as_deref()).await?;
        Ok(serde_json::json!({
            "columns": result.columns,
            "data": result.rows,
        }))
    }

    pub fn to_param(&self) -> serde_json::Value {
        let agent_type_help = format!("Type of agent to use ({})", self.agent_types().join(", "));
        serde_json::json!({
            "type": "function",
            "function": {
                "name": TOOL_NAME,
                "description": "Query the data warehouse using natural language",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Natural language query to execute on the warehouse",
                        },
                        "agent_type": {
                            "type": "string",
                            "description": agent_type_help,
                            "enum": self.agent_types(),
                            "default": self.default_agent_type(),
                        },
                    },
                    "required": ["query"],
                },
            },
        })
    }

    pub async fn close_all(&self) -> Result<()> {
        for slot in self.agents.values() {
            if let Some(agent) = slot.lock().await.as_mut() {
                agent.close().await?;
            }
        }
        Ok(())
    }
}
