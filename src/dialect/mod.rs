//! Database engine strategies.
//!
//! Each supported engine is one variant of [`Dialect`]. A variant knows how
//! to open a connection from an opaque URI, how to read the catalog back as
//! `CREATE TABLE` text, how to quote identifiers, and which `sqlparser`
//! grammar understands its SQL.
mod postgres;
mod sqlite;
mod types;

pub use postgres::{PgSession, PostgresDialect};
pub use sqlite::SqliteDialect;
pub use types::GenericType;

use sqlparser::dialect::{Dialect as SqlGrammar, PostgreSqlDialect, SQLiteDialect};

use crate::config::{DialectKind, Settings};
use crate::error::Result;
use crate::rows::RowSet;

static SQLITE_GRAMMAR: SQLiteDialect = SQLiteDialect {};
static POSTGRES_GRAMMAR: PostgreSqlDialect = PostgreSqlDialect {};

/// Fallback DDL type for generic names no dialect recognizes.
pub const FALLBACK_DDL_TYPE: &str = "TEXT";

#[derive(Debug, Clone)]
pub enum Dialect {
    Sqlite(SqliteDialect),
    Postgres(PostgresDialect),
}

impl Dialect {
    /// Build the dialect selected by configuration.
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.dialect {
            DialectKind::Sqlite => Dialect::Sqlite(SqliteDialect),
            DialectKind::Postgres => {
                Dialect::Postgres(PostgresDialect::new(settings.pg_schema.clone()))
            }
        }
    }

    pub fn kind(&self) -> DialectKind {
        match self {
            Dialect::Sqlite(_) => DialectKind::Sqlite,
            Dialect::Postgres(_) => DialectKind::Postgres,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// The `sqlparser` grammar used for both DDL parsing and validation.
    pub fn grammar(&self) -> &'static dyn SqlGrammar {
        match self {
            Dialect::Sqlite(_) => &SQLITE_GRAMMAR,
            Dialect::Postgres(_) => &POSTGRES_GRAMMAR,
        }
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(name)
    }

    pub fn map_generic_type(&self, ty: GenericType) -> &'static str {
        match self {
            Dialect::Sqlite(_) => sqlite::map_generic_type(ty),
            Dialect::Postgres(_) => postgres::map_generic_type(ty),
        }
    }

    /// Map a generic type name (`"text"`, `"number"`, ...) to this dialect's
    /// DDL type. Unrecognized names map to [`FALLBACK_DDL_TYPE`].
    pub fn map_type_to_ddl(&self, generic: &str) -> &'static str {
        generic
            .parse::<GenericType>()
            .map(|ty| self.map_generic_type(ty))
            .unwrap_or(FALLBACK_DDL_TYPE)
    }

    pub fn genericize_native_type(&self, native: &str) -> GenericType {
        GenericType::classify(native)
    }

    pub async fn connect(&self, uri: &str) -> Result<Connection> {
        match self {
            Dialect::Sqlite(d) => d.open(uri, false).map(Connection::Sqlite),
            Dialect::Postgres(d) => d.connect(uri).await.map(Connection::Postgres),
        }
    }

    /// Read the catalog and render it as DDL. Returns an empty string when
    /// the database has no user tables.
    pub async fn extract_ddl(&self, uri: &str) -> Result<String> {
        let tables = match self {
            Dialect::Sqlite(d) => d.read_catalog(uri).await?,
            Dialect::Postgres(d) => d.read_catalog(uri).await?,
        };
        Ok(render_ddl(&tables, |ty| self.map_generic_type(ty)))
    }
}

/// A live, single-use connection. Running a query consumes it, so the
/// underlying handle is released when that call returns, fails, or is
/// dropped mid-flight.
pub enum Connection {
    Sqlite(rusqlite::Connection),
    Postgres(PgSession),
}

impl Connection {
    pub async fn run(self, sql: &str) -> Result<RowSet> {
        match self {
            Connection::Sqlite(conn) => sqlite::run(conn, sql).await,
            Connection::Postgres(session) => session.run(sql).await,
        }
    }
}

/// Catalog facts for one table, independent of the engine they came from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogTable {
    pub name: String,
    pub columns: Vec<CatalogColumn>,
    /// Primary key columns in key order.
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogColumn {
    pub name: String,
    pub native_type: String,
    pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub referenced_table: String,
    /// Empty when the engine only records the referenced table.
    pub referenced_columns: Vec<String>,
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_identifier(n))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn render_create_table<F>(table: &CatalogTable, map_type: F) -> String
where
    F: Fn(GenericType) -> &'static str,
{
    let mut entries: Vec<String> = table
        .columns
        .iter()
        .map(|col| {
            let ddl_type = map_type(GenericType::classify(&col.native_type));
            let not_null = if col.not_null { " NOT NULL" } else { "" };
            format!("  {} {}{}", quote_identifier(&col.name), ddl_type, not_null)
        })
        .collect();

    if !table.primary_key.is_empty() {
        entries.push(format!("  PRIMARY KEY ({})", quote_list(&table.primary_key)));
    }

    for fk in &table.foreign_keys {
        let target = if fk.referenced_columns.is_empty() {
            String::new()
        } else {
            format!(" ({})", quote_list(&fk.referenced_columns))
        };
        entries.push(format!(
            "  FOREIGN KEY ({}) REFERENCES {}{}",
            quote_list(&fk.columns),
            quote_identifier(&fk.referenced_table),
            target
        ));
    }

    if entries.is_empty() {
        return format!("CREATE TABLE {} ();", quote_identifier(&table.name));
    }

    format!(
        "CREATE TABLE {} (\n{}\n);",
        quote_identifier(&table.name),
        entries.join(",\n")
    )
}

pub fn render_ddl<F>(tables: &[CatalogTable], map_type: F) -> String
where
    F: Fn(GenericType) -> &'static str,
{
    tables
        .iter()
        .map(|t| render_create_table(t, &map_type))
        .collect::<Vec<_>>()
        .join("\n\n")
}
