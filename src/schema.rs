//! Schema Context
//!
//! Immutable bundle of schema description, join rules and output-format rules
//! for one domain. The text is opaque: it is placed verbatim in every prompt
//! and never validated here.

use crate::error::{AgentError, Result};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaContext {
    domain_id: String,
    description: String,
}

impl SchemaContext {
    pub fn new(domain_id: impl Into<String>, description: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            domain_id: domain_id.into(),
            description: description.into(),
        })
    }

    /// Load the description from a prompt file
    pub fn from_file(domain_id: impl Into<String>, path: &Path) -> Result<Arc<Self>> {
        let description = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Configuration(format!(
                "Failed to read schema prompt '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::new(domain_id, description))
    }

    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}
