//! Configuration
//!
//! `AppConfig` is loaded once at process start and handed to the components
//! that need it. Secrets for the model backend may come from the environment
//! (a `.env` file is loaded by the binary before this runs).

use crate::error::{AgentError, Result};
use crate::schema::SchemaContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Named LLM override used by the SQL agents, when configured
pub const SQL_AGENT_LLM: &str = "snowflake";

const DEFAULT_REGISTRATION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    #[default]
    Openai,
    Azure,
    Ollama,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub api_type: ApiType,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("api_type", &self.api_type)
            .field("api_version", &self.api_version)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseKind {
    #[default]
    Snowflake,
    Postgres,
}

/// Credentials for one warehouse registration
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct CredentialSet {
    #[serde(default)]
    pub kind: WarehouseKind,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub warehouse: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Postgres DSN, or a Snowflake host override
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("kind", &self.kind)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("account", &self.account)
            .field("warehouse", &self.warehouse)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("role", &self.role)
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Warehouse credentials keyed by domain key, with an optional `default`
#[derive(Debug, Clone, Default)]
pub struct CredentialRegistry {
    entries: BTreeMap<String, CredentialSet>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, domain_key: impl Into<String>, credentials: CredentialSet) {
        self.entries.insert(domain_key.into(), credentials);
    }

    /// Exact domain key first, then `default`
    pub fn resolve(&self, domain_key: &str) -> Result<&CredentialSet> {
        self.entries
            .get(domain_key)
            .or_else(|| self.entries.get(DEFAULT_REGISTRATION))
            .ok_or_else(|| {
                AgentError::Configuration(format!(
                    "no warehouse credentials registered for domain '{}'",
                    domain_key
                ))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Accepts either a single credential table (registered as `default`) or a
    /// table of tables keyed by domain.
    fn from_toml(table: toml::Table) -> Result<Self> {
        let mut registry = Self::new();
        let per_domain = table.values().any(|v| v.is_table());
        if per_domain {
            for (key, value) in table {
                if let toml::Value::Table(settings) = value {
                    registry.register(key, decode::<CredentialSet>(settings)?);
                }
            }
        } else if !table.is_empty() {
            registry.register(DEFAULT_REGISTRATION, decode::<CredentialSet>(table)?);
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub abort_on_repeat_error: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            abort_on_repeat_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DomainSettings {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema_prompt_path: Option<PathBuf>,
    #[serde(default)]
    pub schema_prompt: Option<String>,
}

#[derive(Deserialize)]
struct RawConfig {
    llm: toml::Table,
    #[serde(default)]
    warehouse: toml::Table,
    #[serde(default)]
    agent: AgentSettings,
    #[serde(default)]
    domains: BTreeMap<String, DomainSettings>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmSettings,
    pub llm_overrides: BTreeMap<String, LlmSettings>,
    pub warehouse: CredentialRegistry,
    pub agent: AgentSettings,
    pub domains: BTreeMap<String, DomainSettings>,
    base_dir: PathBuf,
}

impl AppConfig {
    /// Load from a TOML file, applying environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Configuration(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml_str(&content, base_dir, |key| std::env::var(key).ok())
    }

    pub fn from_toml_str<F>(content: &str, base_dir: PathBuf, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content)?;

        let (mut defaults, named): (toml::Table, toml::Table) = raw
            .llm
            .into_iter()
            .partition(|(_, v)| !v.is_table());
        apply_env_overrides(&mut defaults, &env);

        let mut llm_overrides = BTreeMap::new();
        for (name, value) in named {
            if let toml::Value::Table(overrides) = value {
                let mut merged = defaults.clone();
                merged.extend(overrides);
                llm_overrides.insert(name, decode::<LlmSettings>(merged)?);
            }
        }
        let llm: LlmSettings = decode(defaults)?;

        let config = Self {
            llm,
            llm_overrides,
            warehouse: CredentialRegistry::from_toml(raw.warehouse)?,
            agent: raw.agent,
            domains: raw.domains,
            base_dir,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.agent.max_attempts == 0 {
            return Err(AgentError::Configuration(
                "agent.max_attempts must be at least 1".to_string(),
            ));
        }
        for (key, domain) in &self.domains {
            if domain.schema_prompt.is_none() && domain.schema_prompt_path.is_none() {
                return Err(AgentError::Configuration(format!(
                    "domain '{}' needs schema_prompt or schema_prompt_path",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Named override, falling back to the default settings
    pub fn llm_for(&self, name: &str) -> &LlmSettings {
        self.llm_overrides.get(name).unwrap_or(&self.llm)
    }

    pub fn domain(&self, key: &str) -> Result<&DomainSettings> {
        self.domains.get(key).ok_or_else(|| {
            AgentError::Configuration(format!("no domain '{}' configured", key))
        })
    }

    pub fn domain_keys(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    pub fn agent_name(&self, key: &str) -> String {
        self.domains
            .get(key)
            .and_then(|d| d.agent_name.clone())
            .unwrap_or_else(|| format!("{}_authority", key))
    }

    /// Build the schema context for a domain. Relative prompt paths resolve
    /// against the config file's directory.
    pub fn schema_context(&self, key: &str) -> Result<Arc<SchemaContext>> {
        let domain = self.domain(key)?;
        if let Some(ref prompt) = domain.schema_prompt {
            return Ok(SchemaContext::new(key, prompt.clone()));
        }
        match domain.schema_prompt_path {
            Some(ref path) if path.is_relative() => {
                SchemaContext::from_file(key, &self.base_dir.join(path))
            }
            Some(ref path) => SchemaContext::from_file(key, path),
            None => Err(AgentError::Configuration(format!(
                "domain '{}' has no schema prompt",
                key
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(table: toml::Table) -> Result<T> {
    Ok(toml::Value::Table(table).try_into()?)
}

fn apply_env_overrides<F>(table: &mut toml::Table, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = env("LLM_API_KEY").or_else(|| env("OPENAI_API_KEY")) {
        table.insert("api_key".to_string(), toml::Value::String(key));
    }
    if let Some(model) = env("LLM_MODEL") {
        table.insert("model".to_string(), toml::Value::String(model));
    }
    if let Some(url) = env("LLM_BASE_URL") {
        table.insert("base_url".to_string(), toml::Value::String(url));
    }
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    1.0
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_login_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}
