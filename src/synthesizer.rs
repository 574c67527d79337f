//! SQL Synthesizer
//!
//! Turns a natural-language request, or a repair request carrying the failed
//! statement and its error, into one candidate SQL statement.

use crate::error::Result;
use crate::execution_loop::error_classifier::SqlErrorClass;
use crate::execution_loop::error_recovery::repair_hint;
use crate::llm::{ChatMessage, LlmBackend};
use crate::schema::SchemaContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?si)```sql[ \t]*\r?\n(.*?)```").unwrap();
}

/// What the model is asked to do on one synthesis call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationRequest {
    Initial {
        question: String,
    },
    Repair {
        question: String,
        prior_sql: String,
        prior_error: String,
        error_class: SqlErrorClass,
        /// 1-based index of the attempt this request is for
        attempt: u32,
        max_attempts: u32,
        /// Failures before the prior one, oldest first
        earlier_failures: Vec<FailedStatement>,
    },
}

/// A statement the warehouse or the guard already refused in this session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStatement {
    pub sql: String,
    pub error: String,
}

impl GenerationRequest {
    pub fn initial(question: impl Into<String>) -> Self {
        GenerationRequest::Initial {
            question: question.into(),
        }
    }

    pub fn question(&self) -> &str {
        match self {
            GenerationRequest::Initial { question } => question,
            GenerationRequest::Repair { question, .. } => question,
        }
    }

    pub fn prior_sql(&self) -> Option<&str> {
        match self {
            GenerationRequest::Repair { prior_sql, .. } => Some(prior_sql),
            GenerationRequest::Initial { .. } => None,
        }
    }

    pub fn prior_error(&self) -> Option<&str> {
        match self {
            GenerationRequest::Repair { prior_error, .. } => Some(prior_error),
            GenerationRequest::Initial { .. } => None,
        }
    }
}

/// How the SQL was found in the model output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extraction {
    Fenced,
    /// No fenced SQL block; the whole trimmed response was used
    Unfenced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub raw_model_output: String,
    pub extracted_sql: String,
    pub extraction: Extraction,
}

impl SqlCandidate {
    /// Take the first fenced SQL block, else the whole trimmed output
    pub fn extract(raw_model_output: impl Into<String>) -> Self {
        let raw_model_output = raw_model_output.into();
        let (extracted_sql, extraction) = match SQL_FENCE.captures(&raw_model_output) {
            Some(caps) => (caps[1].trim().to_string(), Extraction::Fenced),
            None => (raw_model_output.trim().to_string(), Extraction::Unfenced),
        };
        Self {
            raw_model_output,
            extracted_sql,
            extraction,
        }
    }

    pub fn is_unfenced(&self) -> bool {
        self.extraction == Extraction::Unfenced
    }
}

pub struct SqlSynthesizer {
    llm: Arc<dyn LlmBackend>,
}

impl SqlSynthesizer {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }

    /// One model call per invocation. Backend failures propagate as
    /// synthesis errors.
    pub async fn synthesize(
        &self,
        schema: &SchemaContext,
        request: &GenerationRequest,
    ) -> Result<SqlCandidate> {
        info!(
            domain = schema.domain_id(),
            "Converting natural language to SQL: {}",
            request.question()
        );

        let prompt = build_prompt(schema, request);
        let response = self.llm.ask(&[ChatMessage::user(prompt)]).await?;

        let candidate = SqlCandidate::extract(response);
        if candidate.is_unfenced() {
            warn!("No SQL code block found in response, using raw response");
        }
        info!("Generated SQL query: {}", candidate.extracted_sql);
        Ok(candidate)
    }
}

pub fn build_prompt(schema: &SchemaContext, request: &GenerationRequest) -> String {
    match request {
        GenerationRequest::Initial { question } => {
            format!("{}\n\n\n#Query: {}\n", schema.description(), question)
        }
        GenerationRequest::Repair {
            question,
            prior_sql,
            prior_error,
            error_class,
            attempt,
            max_attempts,
            earlier_failures,
        } => {
            let mut parts = vec![
                schema.description().to_string(),
                String::new(),
                format!("#Query: {}", question),
                String::new(),
                format!("This is attempt {} of {}.", attempt, max_attempts),
                "The previous SQL query for this request failed.".to_string(),
                format!("Previous SQL query:\n{}", indent(prior_sql)),
                format!("Error: {}", prior_error),
            ];
            if let Some(hint) = repair_hint(*error_class) {
                parts.push(hint.to_string());
            }
            if !earlier_failures.is_empty() {
                parts.push(String::new());
                parts.push(
                    "These statements also failed earlier and must not be repeated:".to_string(),
                );
                for (idx, failure) in earlier_failures.iter().enumerate() {
                    parts.push(format!("{}.\n{}", idx + 1, indent(&failure.sql)));
                    parts.push(format!("   Error: {}", failure.error));
                }
            }
            parts.push(String::new());
            parts.push("Please generate a new SQL query that fixes the error.".to_string());
            parts.push("Remember to:".to_string());
            parts.push("1. Keep the same intent as the original query".to_string());
            parts.push("2. Fix any syntax or semantic errors".to_string());
            parts.push(
                "3. Only read data; never create, alter, drop, truncate, insert, delete or update"
                    .to_string(),
            );
            parts.push("4. Wrap the response in ```sql ... ``` blocks".to_string());
            parts.join("\n")
        }
    }
}

/// Quoted statements are indented, never fenced
fn indent(sql: &str) -> String {
    sql.lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}
