use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Settings;
use crate::correction::{CorrectionLoop, Corrector, EventSink, LoopEvent, QueryProcessor, TurnOutcome};
use crate::dialect::Dialect;
use crate::error::Result;
use crate::execute::QueryExecutor;
use crate::rows::RowSet;
use crate::schema::{SchemaCache, SchemaCacheEntry};
use crate::validate::{validate, ValidationResult};

/// Process-wide entry point: one dialect, one schema cache, one set of
/// limits, shared by every turn.
pub struct Engine {
    dialect: Arc<Dialect>,
    cache: SchemaCache<Arc<Dialect>>,
    settings: Settings,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        let dialect = Dialect::from_settings(&settings);
        Self::with_dialect(settings, dialect)
    }

    /// Use an already configured dialect, e.g. one holding a prompted
    /// password.
    pub fn with_dialect(settings: Settings, dialect: Dialect) -> Self {
        let dialect = Arc::new(dialect);
        Self {
            cache: SchemaCache::new(dialect.clone()),
            dialect,
            settings,
        }
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &SchemaCache<Arc<Dialect>> {
        &self.cache
    }

    pub fn executor(&self) -> QueryExecutor {
        QueryExecutor::new(self.dialect.clone(), self.settings.db_uri.clone())
            .with_timeout(self.settings.query_timeout)
    }

    /// The cached schema for the configured URI.
    pub async fn load_schema(&self) -> Result<Arc<SchemaCacheEntry>> {
        let uri = self.settings.require_uri()?;
        self.cache.entry(uri).await
    }

    /// Validation and execution bound to the schema loaded for this turn.
    /// A schema that failed to load is carried as absent.
    pub async fn session(&self) -> SqlSession {
        match self.load_schema().await {
            Ok(entry) => self.bind(Some(entry)),
            Err(e) => {
                warn!(error = %e, "schema unavailable");
                self.bind(None)
            }
        }
    }

    /// Run one full turn: load the schema, then drive the correction loop
    /// from `candidate` until it succeeds or runs out of iterations.
    ///
    /// Only a missing URI is an error here; every other failure is reported
    /// through `sink` and the returned outcome.
    pub async fn run_turn<C, S>(
        &self,
        question: &str,
        candidate: &str,
        corrector: &C,
        sink: &S,
    ) -> Result<TurnOutcome>
    where
        C: Corrector,
        S: EventSink,
    {
        if let Err(e) = self.settings.require_uri() {
            error!(error = %e, "cannot start turn");
            sink.emit(LoopEvent::SchemaLoaded {
                ddl: schema_error(&e),
            });
            return Err(e);
        }

        let (session, ddl) = match self.load_schema().await {
            Ok(entry) => {
                info!(tables = entry.schema.len(), "schema loaded");
                sink.emit(LoopEvent::SchemaLoaded {
                    ddl: entry.ddl.clone(),
                });
                let ddl = entry.ddl.clone();
                (self.bind(Some(entry)), ddl)
            }
            Err(e) => {
                warn!(error = %e, "schema load failed");
                let ddl = schema_error(&e);
                sink.emit(LoopEvent::SchemaLoaded { ddl: ddl.clone() });
                (self.bind(None), ddl)
            }
        };

        let outcome = CorrectionLoop::new(&session, corrector, sink)
            .max_iterations(self.settings.max_iterations)
            .correction_timeout(self.settings.correction_timeout)
            .run(question, candidate, &ddl)
            .await;
        Ok(outcome)
    }

    fn bind(&self, schema: Option<Arc<SchemaCacheEntry>>) -> SqlSession {
        SqlSession {
            dialect: self.dialect.clone(),
            schema,
            executor: self.executor(),
        }
    }
}

fn schema_error(err: &crate::error::Error) -> String {
    format!("Error loading schema: {}", err)
}

/// The validator and executor for one turn.
pub struct SqlSession {
    dialect: Arc<Dialect>,
    schema: Option<Arc<SchemaCacheEntry>>,
    executor: QueryExecutor,
}

impl SqlSession {
    pub fn schema(&self) -> Option<&SchemaCacheEntry> {
        self.schema.as_deref()
    }
}

impl QueryProcessor for SqlSession {
    fn validate(&self, query: &str) -> ValidationResult {
        validate(
            query,
            self.dialect.grammar(),
            self.schema.as_ref().map(|entry| &entry.schema),
        )
    }

    async fn execute(&self, query: &str) -> std::result::Result<RowSet, String> {
        self.executor.execute(query).await
    }
}
