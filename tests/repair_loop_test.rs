mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use warehouse_sql_agent::config::{AgentSettings, CredentialRegistry};
use warehouse_sql_agent::execution_loop::{AttemptOutcome, SqlErrorClass};
use warehouse_sql_agent::schema::SchemaContext;
use warehouse_sql_agent::synthesizer::Extraction;
use warehouse_sql_agent::{AgentError, SqlAgent};

const ADDRESS_SQL: &str = "SELECT n.name, a.street1, a.city\nFROM CORE.organization_name_latest n\nJOIN CORE.organization_address_latest a ON n.partition = a.partition AND n.partition_id = a.partition_id\nWHERE n.name ILIKE '%Acme Corp%'";

#[tokio::test]
async fn test_address_question_answered_first_try() {
    let llm = ScriptedLlm::answering([fenced(ADDRESS_SQL)]);
    let driver = StubDriver::scripted([Scripted::Rows(
        vec!["name", "street1", "city"],
        vec![vec![json!("Acme Corp"), json!("1 Main St"), json!("Springfield")]],
    )]);
    let mut agent = org_agent(llm.clone(), &driver);

    let result = agent.process("Find the address of Acme Corp").await.unwrap();

    assert_eq!(result.columns, vec!["name", "street1", "city"]);
    assert_eq!(
        result.rows,
        vec![vec![json!("Acme Corp"), json!("1 Main St"), json!("Springfield")]]
    );
    assert_eq!(llm.calls(), 1);
    let prompt = llm.prompt(0);
    assert!(prompt.starts_with(ORG_SCHEMA));
    assert!(prompt.contains("#Query: Find the address of Acme Corp"));
    assert_eq!(driver.state.executed_sql(), vec![ADDRESS_SQL.to_string()]);
}

#[tokio::test]
async fn test_mutating_statements_never_reach_the_warehouse() {
    let update = "UPDATE CORE.organization_core_latest SET LEGAL_ENTITY = TRUE";
    let llm = ScriptedLlm::answering([fenced(update), fenced(update), fenced(update)]);
    let driver = StubDriver::default();
    let mut agent = org_agent(llm.clone(), &driver);

    let err = agent.process("Mark every organization as a legal entity").await.unwrap_err();

    match err {
        AgentError::TerminalRepairFailure { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("DML"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(llm.calls(), 3);
    assert_eq!(driver.state.executes(), 0);
    assert_eq!(driver.state.connects(), 0);
    assert!(llm.prompt(1).contains(update));
    assert!(llm.prompt(1).contains("may modify the database"));
}

#[tokio::test]
async fn test_rejected_statement_repaired_into_select() {
    let llm = ScriptedLlm::answering([
        fenced("DELETE FROM CORE.organization_name_latest WHERE name IS NULL"),
        fenced("SELECT COUNT(*) AS missing FROM CORE.organization_name_latest WHERE name IS NULL"),
    ]);
    let driver = StubDriver::scripted([Scripted::Rows(vec!["missing"], vec![vec![json!(0)]])]);
    let mut agent = org_agent(llm.clone(), &driver);

    let outcome = agent.process_with_trail("How many organizations have no name?").await.unwrap();

    assert_eq!(outcome.result.rows, vec![vec![json!(0)]]);
    assert_eq!(outcome.attempts.len(), 2);
    assert!(matches!(outcome.attempts[0].outcome, AttemptOutcome::Failure(_)));
    assert_eq!(driver.state.executes(), 1);
}

#[tokio::test]
async fn test_repair_prompt_carries_error_and_prior_sql() {
    let bad = "SELECT nam FROM CORE.organization_name_latest";
    let error = "SQL compilation error: error line 1 at position 7\ninvalid identifier 'NAM'";
    let fixed = "SELECT name FROM CORE.organization_name_latest";
    let llm = ScriptedLlm::answering([fenced(bad), fenced(fixed)]);
    let driver = StubDriver::scripted([
        Scripted::Fail(error),
        Scripted::Rows(vec!["name"], vec![vec![json!("Acme Corp")]]),
    ]);
    let mut agent = org_agent(llm.clone(), &driver);

    let outcome = agent.process_with_trail("List organization names").await.unwrap();

    assert_eq!(llm.calls(), 2);
    let repair = llm.prompt(1);
    assert!(repair.contains(error));
    assert!(repair.contains(bad));
    assert!(repair.contains("#Query: List organization names"));
    assert!(repair.starts_with(ORG_SCHEMA));

    let indices: Vec<u32> = outcome.attempts.iter().map(|a| a.attempt_index).collect();
    assert_eq!(indices, vec![1, 2]);
    assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Failure(error.to_string()));
    assert_eq!(SqlErrorClass::from_message(error), SqlErrorClass::ObjectNotFound);
}

#[tokio::test]
async fn test_attempts_bounded_by_max_attempts() {
    let llm = ScriptedLlm::answering(
        (0..10).map(|i| fenced(&format!("SELECT {} FROM missing_table", i))),
    );
    let driver =
        StubDriver::always_failing("Object 'MISSING_TABLE' does not exist or not authorized.");
    let mut agent = org_agent(llm.clone(), &driver).with_settings(&AgentSettings {
        max_attempts: 4,
        abort_on_repeat_error: false,
    });

    let err = agent.process("Anything").await.unwrap_err();

    assert!(matches!(err, AgentError::TerminalRepairFailure { attempts: 4, .. }));
    assert_eq!(
        err.to_string(),
        "Failed to execute query after 4 attempts: Object 'MISSING_TABLE' does not exist or not authorized."
    );
    assert_eq!(llm.calls(), 4);
    assert_eq!(driver.state.executes(), 4);
}

#[tokio::test]
async fn test_statement_handle_released_every_attempt() {
    let llm = ScriptedLlm::answering([fenced("SELECT 1"), fenced("SELECT 2")]);
    let driver = StubDriver::scripted([
        Scripted::Fail("syntax error line 1 at position 0 unexpected 'SELEC'"),
        Scripted::Rows(vec!["2"], vec![vec![json!(2)]]),
    ]);
    let mut agent = org_agent(llm, &driver);

    agent.process("Two").await.unwrap();

    assert_eq!(driver.state.executes(), 2);
    assert_eq!(driver.state.cursor_closes(), 2);
}

#[tokio::test]
async fn test_connection_reused_until_closed() {
    let llm = ScriptedLlm::answering([fenced("SELECT 1"), fenced("SELECT 2"), fenced("SELECT 3")]);
    let driver = StubDriver::scripted([
        Scripted::Rows(vec!["1"], vec![vec![json!(1)]]),
        Scripted::Rows(vec!["2"], vec![vec![json!(2)]]),
        Scripted::Rows(vec!["3"], vec![vec![json!(3)]]),
    ]);
    let mut agent = org_agent(llm, &driver);
    assert!(!agent.is_connected());

    agent.process("One").await.unwrap();
    agent.process("Two").await.unwrap();
    assert_eq!(driver.state.connects(), 1);
    assert!(agent.is_connected());

    agent.close().await.unwrap();
    agent.close().await.unwrap();
    assert_eq!(driver.state.connection_closes(), 1);
    assert!(!agent.is_connected());

    agent.process("Three").await.unwrap();
    assert_eq!(driver.state.connects(), 2);
}

#[tokio::test]
async fn test_backend_failure_is_fatal() {
    let llm = ScriptedLlm::new([Err("503 Service Unavailable".to_string())]);
    let driver = StubDriver::default();
    let mut agent = org_agent(llm.clone(), &driver);

    let err = agent.process("Anything").await.unwrap_err();

    assert!(matches!(err, AgentError::Synthesis(_)));
    assert_eq!(llm.calls(), 1);
    assert_eq!(driver.state.executes(), 0);
}

#[tokio::test]
async fn test_connection_failure_is_fatal() {
    let llm = ScriptedLlm::answering([fenced("SELECT 1"), fenced("SELECT 1")]);
    let driver = StubDriver::refusing_connections("Incorrect username or password was specified.");
    let mut agent = org_agent(llm.clone(), &driver);

    let err = agent.process("Anything").await.unwrap_err();

    assert!(matches!(err, AgentError::Connection(_)));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_missing_credentials_is_configuration_error() {
    let llm = ScriptedLlm::answering([fenced("SELECT 1")]);
    let driver = StubDriver::default();
    let mut agent = SqlAgent::new(
        "org_authority",
        SchemaContext::new("org", ORG_SCHEMA),
        llm.clone(),
        Arc::new(driver.clone()),
        Arc::new(CredentialRegistry::new()),
    );

    let err = agent.process("Anything").await.unwrap_err();

    assert!(matches!(err, AgentError::Configuration(_)));
    assert_eq!(driver.state.connects(), 0);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_repeated_failure_aborts_early() {
    let same = "SELECT name FROM CORE.organization_nam_latest";
    let llm = ScriptedLlm::answering((0..5).map(|_| fenced(same)));
    let driver = StubDriver::always_failing(
        "Object 'CORE.ORGANIZATION_NAM_LATEST' does not exist or not authorized.",
    );
    let mut agent = org_agent(llm.clone(), &driver).with_settings(&AgentSettings {
        max_attempts: 5,
        abort_on_repeat_error: true,
    });

    let err = agent.process("List names").await.unwrap_err();

    assert!(matches!(err, AgentError::TerminalRepairFailure { attempts: 2, .. }));
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_each_repair_prompt_is_distinct() {
    let same = "SELECT name FROM CORE.organization_nam_latest";
    let error = "Object 'CORE.ORGANIZATION_NAM_LATEST' does not exist or not authorized.";
    let llm = ScriptedLlm::answering((0..3).map(|_| fenced(same)));
    let driver = StubDriver::always_failing(error);
    let mut agent = org_agent(llm.clone(), &driver).with_settings(&AgentSettings {
        max_attempts: 3,
        abort_on_repeat_error: false,
    });

    let err = agent.process("List names").await.unwrap_err();

    assert!(matches!(err, AgentError::TerminalRepairFailure { attempts: 3, .. }));
    assert_eq!(llm.calls(), 3);
    assert_ne!(llm.prompt(1), llm.prompt(2));
    assert!(llm.prompt(1).contains("attempt 2 of 3"));
    assert!(!llm.prompt(1).contains("also failed earlier"));

    let last = llm.prompt(2);
    assert!(last.contains("attempt 3 of 3"));
    assert!(last.contains("These statements also failed earlier and must not be repeated:"));
    assert_eq!(last.matches(error).count(), 2);
    assert!(!last.contains("```sql\n"));
}

#[tokio::test]
async fn test_lost_session_reconnects_on_next_question() {
    let llm = ScriptedLlm::answering([fenced("SELECT 1"), fenced("SELECT 1")]);
    let driver = StubDriver::scripted([
        Scripted::Disconnect("Snowflake session ended: Session no longer exists."),
        Scripted::Rows(vec!["1"], vec![vec![json!(1)]]),
    ]);
    let mut agent = org_agent(llm.clone(), &driver);

    let err = agent.process("One").await.unwrap_err();
    assert!(matches!(err, AgentError::Connection(_)));
    assert_eq!(llm.calls(), 1);
    assert!(!agent.is_connected());
    assert_eq!(driver.state.cursor_closes(), 1);

    let result = agent.process("One").await.unwrap();
    assert_eq!(result.rows, vec![vec![json!(1)]]);
    assert_eq!(driver.state.connects(), 2);
    assert!(agent.is_connected());
}

#[tokio::test]
async fn test_unfenced_response_used_verbatim() {
    let llm = ScriptedLlm::answering(["SELECT 1 AS one"]);
    let driver = StubDriver::scripted([Scripted::Rows(vec!["ONE"], vec![vec![json!(1)]])]);
    let mut agent = org_agent(llm, &driver);

    let outcome = agent.process_with_trail("One").await.unwrap();

    assert_eq!(driver.state.executed_sql(), vec!["SELECT 1 AS one".to_string()]);
    assert_eq!(outcome.attempts[0].candidate.extraction, Extraction::Unfenced);
    assert_eq!(outcome.result.columns, vec!["ONE"]);
}

#[tokio::test]
async fn test_empty_result_set_keeps_columns() {
    let sql = "SELECT name FROM CORE.organization_name_latest WHERE 1 = 0";
    let llm = ScriptedLlm::answering([fenced(sql)]);
    let driver = StubDriver::scripted([Scripted::Rows(vec!["name"], Vec::new())]);
    let mut agent = org_agent(llm, &driver);

    let result = agent.process("Nothing").await.unwrap();

    assert_eq!(result.columns, vec!["name"]);
    assert_eq!(result.row_count(), 0);
}
