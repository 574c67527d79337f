//! Text-to-SQL agent for a data warehouse.
//!
//! A question is turned into SQL by a language model, vetted by a statement
//! guard, executed on the warehouse and, on failure, repaired with the error
//! fed back to the model for a bounded number of attempts.

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution_loop;
pub mod executor;
pub mod guard;
pub mod llm;
pub mod schema;
pub mod synthesizer;
pub mod tool;
pub mod warehouse;

pub use agent::SqlAgent;
pub use config::{AppConfig, CredentialRegistry, CredentialSet};
pub use error::{AgentError, Result};
pub use execution_loop::{RepairLoop, RepairOutcome, SqlErrorClass};
pub use executor::QueryResult;
pub use guard::StatementGuard;
pub use llm::{ChatMessage, LlmBackend, LlmClient};
pub use schema::SchemaContext;
pub use synthesizer::{GenerationRequest, SqlCandidate, SqlSynthesizer};
pub use tool::WarehouseTool;
