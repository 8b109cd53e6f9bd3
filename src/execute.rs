use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dialect::Dialect;
use crate::error::Error;
use crate::rows::RowSet;

pub const NO_URI: &str = "DB_URI not set.";
pub const NO_QUERY: &str = "No SQL query found in state to execute.";
pub const SKIPPED_AFTER_VALIDATION: &str = "Validation failed";

/// Outcome of one execution attempt, as recorded in a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecutionResult {
    Success { rows: RowSet },
    Error { error_message: String },
    /// The query was never sent because validation rejected it.
    Skipped { reason: String },
}

impl ExecutionResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        ExecutionResult::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ExecutionResult::Error { error_message } => Some(error_message),
            _ => None,
        }
    }
}

impl From<Result<RowSet, String>> for ExecutionResult {
    fn from(result: Result<RowSet, String>) -> Self {
        match result {
            Ok(rows) => ExecutionResult::Success { rows },
            Err(error_message) => ExecutionResult::Error { error_message },
        }
    }
}

/// Runs queries against the configured database, one connection per call.
///
/// Every failure (missing URI, connect, prepare, fetch, timeout) comes back
/// as a message string; nothing is raised past this boundary.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    dialect: Arc<Dialect>,
    uri: Option<String>,
    timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(dialect: Arc<Dialect>, uri: Option<String>) -> Self {
        Self {
            dialect,
            uri,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub async fn execute(&self, query: &str) -> Result<RowSet, String> {
        let Some(uri) = self.uri.as_deref() else {
            warn!("execution requested without a database URI");
            return Err(NO_URI.to_string());
        };
        if query.trim().is_empty() {
            return Err(NO_QUERY.to_string());
        }

        debug!(dialect = self.dialect.name(), query, "executing query");
        let attempt = async {
            let conn = self.dialect.connect(uri).await?;
            conn.run(query).await
        };
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
            None => attempt.await,
        };

        match outcome {
            Ok(rows) => {
                info!(
                    rows = rows.row_count(),
                    affected = rows.affected_rows,
                    elapsed_ms = rows.elapsed.as_millis() as u64,
                    "query executed"
                );
                Ok(rows)
            }
            Err(e) => {
                warn!(error = %e, "query execution failed");
                Err(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use crate::rows::CellValue;
    use tempfile::TempDir;

    fn executor(sql: &str) -> (TempDir, QueryExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(sql).unwrap();
        let uri = format!("sqlite://{}", path.display());
        let dialect = Arc::new(Dialect::Sqlite(SqliteDialect));
        (dir, QueryExecutor::new(dialect, Some(uri)))
    }

    const CUSTOMERS: &str = "CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT);
        INSERT INTO customer (name) VALUES ('Ada'), ('Grace');";

    #[tokio::test]
    async fn test_execute_returns_rows() {
        let (_dir, exec) = executor(CUSTOMERS);
        let rows = exec.execute("SELECT COUNT(*) FROM customer;").await.unwrap();
        assert_eq!(rows.rows, vec![vec![CellValue::Int64(2)]]);
    }

    #[tokio::test]
    async fn test_driver_error_becomes_message() {
        let (_dir, exec) = executor(CUSTOMERS);
        let err = exec.execute("SELECT * FROM orders").await.unwrap_err();
        assert_eq!(err, "no such table: orders");
    }

    #[tokio::test]
    async fn test_missing_uri_checked_first() {
        let exec = QueryExecutor::new(Arc::new(Dialect::Sqlite(SqliteDialect)), None);
        assert_eq!(exec.execute("").await.unwrap_err(), NO_URI);
        assert_eq!(exec.execute("SELECT 1").await.unwrap_err(), NO_URI);
    }

    #[tokio::test]
    async fn test_empty_query() {
        let (_dir, exec) = executor(CUSTOMERS);
        assert_eq!(exec.execute("  \n").await.unwrap_err(), NO_QUERY);
    }

    #[tokio::test]
    async fn test_unreachable_database() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("missing.db").display().to_string();
        let exec = QueryExecutor::new(Arc::new(Dialect::Sqlite(SqliteDialect)), Some(uri));
        let err = exec.execute("SELECT 1").await.unwrap_err();
        assert!(err.starts_with("connection failed"), "{}", err);
    }

    #[tokio::test]
    async fn test_timeout_interrupts_long_query() {
        let (_dir, exec) = executor(CUSTOMERS);
        let exec = exec.with_timeout(Some(Duration::from_millis(200)));
        let err = exec
            .execute(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100000000)
                 SELECT COUNT(*) FROM c",
            )
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout(Duration::from_millis(200)).to_string());
    }

    #[test]
    fn test_result_serialization() {
        let err = ExecutionResult::from(Err::<RowSet, _>("boom".to_string()));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"status": "error", "error_message": "boom"})
        );
        assert_eq!(err.error_message(), Some("boom"));

        let skipped = ExecutionResult::skipped(SKIPPED_AFTER_VALIDATION);
        assert_eq!(
            serde_json::to_value(&skipped).unwrap(),
            serde_json::json!({"status": "skipped", "reason": "Validation failed"})
        );
        assert!(!skipped.is_success());
        assert_eq!(skipped.error_message(), None);
    }
}
