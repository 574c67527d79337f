//! Statement Guard
//!
//! Static policy check that keeps model-generated statements able to mutate
//! schema or data away from the warehouse. This is a textual filter, not a
//! parser: a denylisted keyword followed by whitespace anywhere in the
//! statement rejects it, regardless of case.

use crate::error::{AgentError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

lazy_static! {
    static ref DENYLIST: Regex =
        Regex::new(r"(?i)(CREATE|ALTER|DROP|TRUNCATE|INSERT|DELETE|UPDATE)\s").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolatedRule {
    /// Schema mutation: CREATE, ALTER, DROP, TRUNCATE
    Ddl,
    /// Data mutation: INSERT, DELETE, UPDATE
    Dml,
}

impl fmt::Display for ViolatedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolatedRule::Ddl => write!(f, "DDL"),
            ViolatedRule::Dml => write!(f, "DML"),
        }
    }
}

impl ViolatedRule {
    fn for_keyword(keyword: &str) -> Self {
        match keyword {
            "INSERT" | "DELETE" | "UPDATE" => ViolatedRule::Dml,
            _ => ViolatedRule::Ddl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardVerdict {
    pub allowed: bool,
    pub violated_rule: Option<ViolatedRule>,
    /// The denylisted keyword that matched first, upper-cased
    pub keyword: Option<String>,
}

impl GuardVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            violated_rule: None,
            keyword: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatementGuard;

impl StatementGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, sql: &str) -> GuardVerdict {
        match DENYLIST.captures(sql) {
            Some(caps) => {
                let keyword = caps[1].to_uppercase();
                GuardVerdict {
                    allowed: false,
                    violated_rule: Some(ViolatedRule::for_keyword(&keyword)),
                    keyword: Some(keyword),
                }
            }
            None => GuardVerdict::allow(),
        }
    }

    /// Like [`check`](Self::check), but a rejection becomes an error.
    pub fn enforce(&self, sql: &str) -> Result<()> {
        let verdict = self.check(sql);
        if verdict.allowed {
            return Ok(());
        }
        let rule = verdict.violated_rule.unwrap_or(ViolatedRule::Ddl);
        let keyword = verdict.keyword.unwrap_or_default();
        error!(%rule, %keyword, "Rejected mutating SQL statement: {}", sql);
        Err(AgentError::GuardRejection { rule, keyword })
    }
}
