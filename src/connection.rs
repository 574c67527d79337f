//! Connection Manager
//!
//! Owns at most one warehouse handle for an agent. Connects on demand using
//! the credentials registered for the agent's domain key (the part of the
//! agent name before the first underscore), falling back to `default`.

use crate::config::CredentialRegistry;
use crate::error::{AgentError, Result};
use crate::warehouse::{WarehouseConnection, WarehouseDriver};
use std::sync::Arc;
use tracing::{info, warn};

/// `org_authority` -> `org`
pub fn domain_key_for(agent_name: &str) -> &str {
    agent_name.split('_').next().unwrap_or(agent_name)
}

pub struct ConnectionManager {
    driver: Arc<dyn WarehouseDriver>,
    credentials: Arc<CredentialRegistry>,
    domain_key: String,
    handle: Option<Box<dyn WarehouseConnection>>,
}

impl ConnectionManager {
    pub fn new(
        agent_name: &str,
        driver: Arc<dyn WarehouseDriver>,
        credentials: Arc<CredentialRegistry>,
    ) -> Self {
        Self {
            driver,
            credentials,
            domain_key: domain_key_for(agent_name).to_string(),
            handle: None,
        }
    }

    pub fn domain_key(&self) -> &str {
        &self.domain_key
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Idempotent: an open handle is reused as is.
    pub async fn ensure_connected(&mut self) -> Result<&mut dyn WarehouseConnection> {
        if self.handle.is_none() {
            if self.credentials.is_empty() {
                return Err(AgentError::Configuration(
                    "No warehouse connection parameters configured".to_string(),
                ));
            }
            let credentials = self.credentials.resolve(&self.domain_key)?;
            warn!(domain = %self.domain_key, "Not connected to warehouse, attempting to connect");
            let connection = self.driver.connect(credentials).await?;
            info!(
                domain = %self.domain_key,
                driver = self.driver.name(),
                "Warehouse connection established"
            );
            self.handle = Some(connection);
        }

        match self.handle.as_deref_mut() {
            Some(handle) => Ok(handle),
            None => Err(AgentError::Connection("warehouse handle unavailable".to_string())),
        }
    }

    /// Forget a handle whose session is gone without trying to close it
    pub fn discard(&mut self, reason: &str) {
        if self.handle.take().is_some() {
            warn!(domain = %self.domain_key, "Dropping warehouse connection: {}", reason);
        }
    }

    /// Idempotent. A later `ensure_connected` opens a new handle.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            info!(domain = %self.domain_key, "Closing warehouse connection");
            handle.close().await?;
            info!(domain = %self.domain_key, "Warehouse connection closed");
        }
        Ok(())
    }
}
