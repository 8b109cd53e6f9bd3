use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use sqlparser::dialect::Dialect as SqlGrammar;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{parse_ddl, DdlDiagnostic, StructuredSchema};
use crate::dialect::Dialect;
use crate::error::Result;

/// Where cached schemas come from: something that can read DDL for a URI
/// and name the grammar that DDL is written in.
pub trait SchemaSource: Send + Sync {
    fn extract_ddl(&self, uri: &str) -> impl Future<Output = Result<String>> + Send;

    fn grammar(&self) -> &'static dyn SqlGrammar;
}

impl SchemaSource for Dialect {
    fn extract_ddl(&self, uri: &str) -> impl Future<Output = Result<String>> + Send {
        Dialect::extract_ddl(self, uri)
    }

    fn grammar(&self) -> &'static dyn SqlGrammar {
        Dialect::grammar(self)
    }
}

impl<T: SchemaSource> SchemaSource for Arc<T> {
    fn extract_ddl(&self, uri: &str) -> impl Future<Output = Result<String>> + Send {
        T::extract_ddl(self, uri)
    }

    fn grammar(&self) -> &'static dyn SqlGrammar {
        T::grammar(self)
    }
}

/// DDL text and the schema parsed from that exact text.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaCacheEntry {
    pub ddl: String,
    pub schema: StructuredSchema,
    pub diagnostics: Vec<DdlDiagnostic>,
}

type Slot = Arc<OnceCell<Arc<SchemaCacheEntry>>>;

/// Per-URI schema memo. Entries are built at most once per URI, even under
/// concurrent requests, and are never invalidated.
pub struct SchemaCache<S> {
    source: S,
    slots: Mutex<HashMap<String, Slot>>,
}

impl<S: SchemaSource> SchemaCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn get_ddl(&self, uri: &str) -> Result<String> {
        Ok(self.entry(uri).await?.ddl.clone())
    }

    pub async fn get_structured_schema(&self, uri: &str) -> Result<StructuredSchema> {
        Ok(self.entry(uri).await?.schema.clone())
    }

    /// The cached entry for `uri`, populating it first if needed. Callers
    /// racing on an absent key all wait for the same population.
    pub async fn entry(&self, uri: &str) -> Result<Arc<SchemaCacheEntry>> {
        let slot = self.slot(uri);
        match slot.get_or_try_init(|| self.populate(uri)).await {
            Ok(entry) => Ok(entry.clone()),
            Err(e) => {
                self.discard_empty(uri, &slot);
                Err(e)
            }
        }
    }

    pub fn is_cached(&self, uri: &str) -> bool {
        self.lock()
            .get(uri)
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, uri: &str) -> Slot {
        self.lock().entry(uri.to_string()).or_default().clone()
    }

    fn discard_empty(&self, uri: &str, slot: &Slot) {
        let mut slots = self.lock();
        if let Some(current) = slots.get(uri) {
            if Arc::ptr_eq(current, slot) && !current.initialized() {
                slots.remove(uri);
            }
        }
    }

    async fn populate(&self, uri: &str) -> Result<Arc<SchemaCacheEntry>> {
        let start = Instant::now();
        let ddl = self.source.extract_ddl(uri).await.map_err(|e| {
            warn!(error = %e, "schema extraction failed");
            e
        })?;
        let parsed = parse_ddl(&ddl, self.source.grammar());
        info!(
            tables = parsed.schema.len(),
            skipped = parsed.diagnostics.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "schema cached"
        );
        debug!(ddl = %ddl, "cached DDL");
        Ok(Arc::new(SchemaCacheEntry {
            ddl,
            schema: parsed.schema,
            diagnostics: parsed.diagnostics,
        }))
    }
}
