use std::time::Duration;

use thiserror::Error;

/// Failures raised by the dialect adapters, the schema cache and the
/// configuration layer.
///
/// Validation and execution failures inside a correction turn are never
/// surfaced through this type; they are folded into
/// [`ValidationResult`](crate::validate::ValidationResult) and
/// [`ExecutionResult`](crate::execute::ExecutionResult) values instead.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Missing URI, unsupported dialect name, or an invalid setting.
    #[error("{0}")]
    Configuration(String),
    /// The database could not be reached or the URI was rejected.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Catalog metadata could not be read.
    #[error("schema introspection failed: {0}")]
    Introspection(String),
    /// The driver reported a failure while running or fetching a query.
    #[error("{0}")]
    Execution(String),
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn connection(err: impl std::fmt::Display) -> Self {
        Error::Connection(err.to_string())
    }

    pub fn introspection(err: impl std::fmt::Display) -> Self {
        Error::Introspection(err.to_string())
    }
}
