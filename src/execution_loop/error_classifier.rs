//! Error Classifier
//!
//! Classifies warehouse and guard failures into a taxonomy for recovery.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL error classification taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlErrorClass {
    Syntax,
    ObjectNotFound,
    AmbiguousColumn,
    Permission,
    Timeout,
    Transient,
    GuardRejection,
    Other,
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorClass::Syntax => write!(f, "Syntax"),
            SqlErrorClass::ObjectNotFound => write!(f, "ObjectNotFound"),
            SqlErrorClass::AmbiguousColumn => write!(f, "AmbiguousColumn"),
            SqlErrorClass::Permission => write!(f, "Permission"),
            SqlErrorClass::Timeout => write!(f, "Timeout"),
            SqlErrorClass::Transient => write!(f, "Transient"),
            SqlErrorClass::GuardRejection => write!(f, "GuardRejection"),
            SqlErrorClass::Other => write!(f, "Other"),
        }
    }
}

impl SqlErrorClass {
    /// Pattern match on a driver message
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("ambiguous") && msg.contains("column") {
            return SqlErrorClass::AmbiguousColumn;
        }

        if contains_any(&msg, &["syntax error", "unexpected", "parse error"]) {
            return SqlErrorClass::Syntax;
        }

        if msg.contains("invalid identifier")
            || msg.contains("does not exist")
            || msg.contains("not found")
            || (msg.contains("object") && msg.contains("not authorized"))
        {
            return SqlErrorClass::ObjectNotFound;
        }

        if contains_any(&msg, &["permission denied", "insufficient privileges", "access denied"]) {
            return SqlErrorClass::Permission;
        }

        if contains_any(&msg, &["timeout", "timed out", "canceled", "cancelled"]) {
            return SqlErrorClass::Timeout;
        }

        if contains_any(&msg, &["connection", "temporarily unavailable", "503", "502"]) {
            return SqlErrorClass::Transient;
        }

        SqlErrorClass::Other
    }
}

fn contains_any(msg: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| msg.contains(p))
}

/// Error classifier
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error into the taxonomy
    pub fn classify(&self, error: &AgentError) -> SqlErrorClass {
        match error {
            AgentError::GuardRejection { .. } => SqlErrorClass::GuardRejection,
            AgentError::Execution { class, .. } => *class,
            other => SqlErrorClass::from_message(&other.to_string()),
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
