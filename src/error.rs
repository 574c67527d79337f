use crate::execution_loop::error_classifier::SqlErrorClass;
use crate::guard::ViolatedRule;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("SQL statement is a {rule} statement ('{keyword}') which may modify the database, so it will not be executed")]
    GuardRejection { rule: ViolatedRule, keyword: String },

    #[error("Execution error: {message}")]
    Execution { class: SqlErrorClass, message: String },

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to execute query after {attempts} attempts: {last_error}")]
    TerminalRepairFailure { attempts: u32, last_error: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AgentError {
    /// Builds an execution error, classifying the driver message.
    pub fn execution(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = SqlErrorClass::from_message(&message);
        AgentError::Execution { class, message }
    }

    /// Failures the repair loop may answer with a new statement.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::GuardRejection { .. } | AgentError::Execution { .. }
        )
    }

    /// The text fed back to the model when repairing. For execution errors
    /// this is the warehouse's own message, without our prefix.
    pub fn feedback_text(&self) -> String {
        match self {
            AgentError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
