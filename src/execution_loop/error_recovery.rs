//! Error Recovery
//!
//! Class-specific guidance appended to repair prompts, after the literal
//! error text and failed statement.

use crate::execution_loop::error_classifier::SqlErrorClass;

pub fn repair_hint(class: SqlErrorClass) -> Option<&'static str> {
    match class {
        SqlErrorClass::Syntax => Some(
            "Hint: the statement could not be parsed. Check keywords, commas, quoting and that no reserved word is used as a table alias.",
        ),
        SqlErrorClass::ObjectNotFound => Some(
            "Hint: a table or column referenced does not exist. Use only the tables and columns listed in the schema, qualified with the schema name.",
        ),
        SqlErrorClass::AmbiguousColumn => Some(
            "Hint: a column reference is ambiguous. Prefix every column with its table alias.",
        ),
        SqlErrorClass::Permission => Some(
            "Hint: the statement touched an object the service role may not read. Stay within the tables listed in the schema.",
        ),
        SqlErrorClass::Timeout => Some(
            "Hint: the statement ran too long. Narrow the filters, avoid unnecessary joins and keep a LIMIT.",
        ),
        SqlErrorClass::GuardRejection => Some(
            "Hint: the statement was rejected because it could modify the database. Produce a single read-only SELECT statement.",
        ),
        SqlErrorClass::Transient | SqlErrorClass::Other => None,
    }
}
