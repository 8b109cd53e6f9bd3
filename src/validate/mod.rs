//! Static query verification: syntax under the dialect grammar, then name
//! resolution against the cached schema. Nothing here touches the database.
mod resolve;

use serde::Serialize;
use sqlparser::dialect::Dialect as SqlGrammar;
use sqlparser::parser::Parser;
use tracing::{debug, info};

use crate::schema::StructuredSchema;

pub const NO_QUERY: &str = "No SQL query found in state to validate.";
pub const SCHEMA_UNAVAILABLE: &str = "Database schema not available for validation.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ValidationResult {
    Success,
    Error { errors: Vec<String> },
}

impl ValidationResult {
    pub fn error(message: impl Into<String>) -> Self {
        ValidationResult::Error {
            errors: vec![message.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ValidationResult::Success)
    }

    pub fn errors(&self) -> &[String] {
        match self {
            ValidationResult::Success => &[],
            ValidationResult::Error { errors } => errors,
        }
    }

    /// All error messages on one line, or `None` on success.
    pub fn summary(&self) -> Option<String> {
        match self {
            ValidationResult::Success => None,
            ValidationResult::Error { errors } => Some(errors.join("; ")),
        }
    }
}

/// Check one candidate query.
///
/// A parse failure is reported verbatim and stops there; only a query that
/// parses to exactly one statement goes on to name resolution.
pub fn validate(
    query: &str,
    grammar: &dyn SqlGrammar,
    schema: Option<&StructuredSchema>,
) -> ValidationResult {
    if query.trim().is_empty() {
        return ValidationResult::error(NO_QUERY);
    }
    let Some(schema) = schema else {
        return ValidationResult::error(SCHEMA_UNAVAILABLE);
    };

    let statements = match Parser::parse_sql(grammar, query) {
        Ok(statements) => statements,
        Err(e) => {
            debug!(error = %e, "query failed to parse");
            return ValidationResult::error(e.to_string());
        }
    };

    let statement = match statements.as_slice() {
        [] => return ValidationResult::error(NO_QUERY),
        [single] => single,
        many => {
            return ValidationResult::error(format!(
                "Expected a single SQL statement, found {}",
                many.len()
            ))
        }
    };

    let errors = resolve::resolve_statement(statement, schema);
    if errors.is_empty() {
        info!("query validated");
        ValidationResult::Success
    } else {
        info!(errors = errors.len(), "query failed name resolution");
        ValidationResult::Error { errors }
    }
}
