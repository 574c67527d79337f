//! Repair Loop
//!
//! Bounded synthesize -> guard -> execute cycle. Retryable failures (guard
//! rejections and execution errors) are fed back to the synthesizer as a
//! repair request; everything else propagates immediately.

use crate::connection::ConnectionManager;
use crate::error::{AgentError, Result};
use crate::execution_loop::error_classifier::ErrorClassifier;
use crate::executor::{QueryExecutor, QueryResult};
use crate::guard::StatementGuard;
use crate::schema::SchemaContext;
use crate::synthesizer::{FailedStatement, GenerationRequest, SqlCandidate, SqlSynthesizer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success(QueryResult),
    Failure(String),
}

/// One synthesize -> guard -> execute cycle of a repair session
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt_index: u32,
    pub candidate: SqlCandidate,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub result: QueryResult,
    pub attempts: Vec<AttemptRecord>,
}

/// Execution loop with bounded retries
pub struct RepairLoop {
    max_attempts: u32,
    abort_on_repeat_error: bool,
    guard: StatementGuard,
    executor: QueryExecutor,
    error_classifier: ErrorClassifier,
}

impl Default for RepairLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, false)
    }
}

impl RepairLoop {
    /// `max_attempts` below 1 is raised to 1.
    pub fn new(max_attempts: u32, abort_on_repeat_error: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            abort_on_repeat_error,
            guard: StatementGuard::new(),
            executor: QueryExecutor::new(),
            error_classifier: ErrorClassifier::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn run(
        &self,
        synthesizer: &SqlSynthesizer,
        schema: &SchemaContext,
        question: &str,
        connections: &mut ConnectionManager,
    ) -> Result<RepairOutcome> {
        let session_id = Uuid::new_v4();
        let span = info_span!("repair_session", %session_id, domain = schema.domain_id());
        self.run_session(synthesizer, schema, question, connections)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        synthesizer: &SqlSynthesizer,
        schema: &SchemaContext,
        question: &str,
        connections: &mut ConnectionManager,
    ) -> Result<RepairOutcome> {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut request = GenerationRequest::initial(question);
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            info!("Execution attempt {} of {}", attempt, self.max_attempts);
            let started_at = Utc::now();
            let clock = Instant::now();

            // Backend failures are not bad SQL; they end the session
            let candidate = synthesizer.synthesize(schema, &request).await?;

            match self.attempt(&candidate, connections, attempt).await {
                Ok(result) => {
                    attempts.push(AttemptRecord {
                        attempt_index: attempt,
                        candidate,
                        outcome: AttemptOutcome::Success(result.clone()),
                        started_at,
                        elapsed_ms: clock.elapsed().as_millis() as u64,
                    });
                    info!("Execution succeeded on attempt {}", attempt);
                    return Ok(RepairOutcome { result, attempts });
                }
                Err(e) if e.is_retryable() => {
                    let error_text = e.feedback_text();
                    let error_class = self.error_classifier.classify(&e);
                    warn!(
                        %error_class,
                        "Attempt {} of {} failed: {}", attempt, self.max_attempts, error_text
                    );

                    let repeated = attempts.last().map_or(false, |prev| {
                        prev.candidate.extracted_sql == candidate.extracted_sql
                            && prev.outcome == AttemptOutcome::Failure(error_text.clone())
                    });

                    attempts.push(AttemptRecord {
                        attempt_index: attempt,
                        candidate: candidate.clone(),
                        outcome: AttemptOutcome::Failure(error_text.clone()),
                        started_at,
                        elapsed_ms: clock.elapsed().as_millis() as u64,
                    });

                    if self.abort_on_repeat_error && repeated {
                        warn!("Same statement failed the same way twice, aborting");
                        return Err(AgentError::TerminalRepairFailure {
                            attempts: attempt,
                            last_error: error_text,
                        });
                    }

                    request = GenerationRequest::Repair {
                        question: question.to_string(),
                        prior_sql: candidate.extracted_sql,
                        prior_error: error_text.clone(),
                        error_class,
                        attempt: attempt + 1,
                        max_attempts: self.max_attempts,
                        earlier_failures: earlier_failures(&attempts),
                    };
                    last_error = error_text;
                }
                Err(e) => {
                    error!("Non-retryable failure on attempt {}: {}", attempt, e);
                    return Err(e);
                }
            }
        }

        error!("Giving up after {} attempts: {}", self.max_attempts, last_error);
        Err(AgentError::TerminalRepairFailure {
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Guard, then connect lazily, then execute. A session the warehouse has
    /// ended is dropped so the next request reconnects.
    async fn attempt(
        &self,
        candidate: &SqlCandidate,
        connections: &mut ConnectionManager,
        attempt: u32,
    ) -> Result<QueryResult> {
        self.guard.enforce(&candidate.extracted_sql)?;
        let connection = connections.ensure_connected().await?;
        let result = self
            .executor
            .execute(connection, &candidate.extracted_sql, attempt, self.max_attempts)
            .await;
        if let Err(AgentError::Connection(ref e)) = result {
            connections.discard(e);
        }
        result
    }
}

/// Every failed attempt except the latest, oldest first
fn earlier_failures(attempts: &[AttemptRecord]) -> Vec<FailedStatement> {
    let older = attempts.len().saturating_sub(1);
    attempts[..older]
        .iter()
        .filter_map(|record| match record.outcome {
            AttemptOutcome::Failure(ref error) => Some(FailedStatement {
                sql: record.candidate.extracted_sql.clone(),
                error: error.clone(),
            }),
            AttemptOutcome::Success(_) => None,
        })
        .collect()
}
