use std::collections::BTreeMap;
use std::time::Instant;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, InterruptHandle, OpenFlags};
use tracing::debug;

use super::{CatalogColumn, CatalogTable, ForeignKey, GenericType};
use crate::error::{Error, Result};
use crate::rows::{CellValue, RowSet};

/// Embedded, file-based engine. The URI is a filesystem path, optionally
/// prefixed with `sqlite://`, or a `file:` URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

pub(super) fn map_generic_type(ty: GenericType) -> &'static str {
    match ty {
        GenericType::Text => "TEXT",
        GenericType::Number => "REAL",
        GenericType::Integer => "INTEGER",
        GenericType::Boolean => "BOOLEAN",
        GenericType::Timestamp => "TIMESTAMP",
        GenericType::Date => "DATE",
    }
}

fn database_path(uri: &str) -> &str {
    let uri = uri.trim();
    uri.strip_prefix("sqlite://")
        .or_else(|| uri.strip_prefix("sqlite:"))
        .unwrap_or(uri)
}

impl SqliteDialect {
    /// Open an existing database. The file is never created here, so a
    /// mistyped path surfaces as a connection error instead of an empty
    /// schema.
    pub(super) fn open(&self, uri: &str, read_only: bool) -> Result<Connection> {
        let path = database_path(uri);
        if path.is_empty() {
            return Err(Error::connection("empty SQLite database path"));
        }

        let mode = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        let flags = mode | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        Connection::open_with_flags(path, flags)
            .map_err(|e| Error::connection(format!("{}: {}", path, e)))
    }

    pub(super) async fn read_catalog(&self, uri: &str) -> Result<Vec<CatalogTable>> {
        let conn = self.open(uri, true)?;
        tokio::task::spawn_blocking(move || read_tables(&conn))
            .await
            .map_err(Error::introspection)?
    }
}

fn read_tables(conn: &Connection) -> Result<Vec<CatalogTable>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
             ORDER BY rowid",
        )
        .map_err(Error::introspection)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(Error::introspection)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::introspection)?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        tables.push(read_table(conn, name)?);
    }
    debug!(tables = tables.len(), "read sqlite catalog");
    Ok(tables)
}

fn read_table(conn: &Connection, name: String) -> Result<CatalogTable> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
        )
        .map_err(Error::introspection)?;
    let rows = stmt
        .query_map(params![name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                row.get::<_, i64>(2)? != 0,
                row.get::<_, i64>(3)?,
            ))
        })
        .map_err(Error::introspection)?;

    let mut columns = Vec::new();
    let mut pk_positions = Vec::new();
    for row in rows {
        let (col_name, native_type, not_null, pk) = row.map_err(Error::introspection)?;
        if pk > 0 {
            pk_positions.push((pk, col_name.clone()));
        }
        columns.push(CatalogColumn {
            name: col_name,
            native_type,
            not_null,
        });
    }
    pk_positions.sort_by_key(|(pos, _)| *pos);

    Ok(CatalogTable {
        foreign_keys: read_foreign_keys(conn, &name)?,
        primary_key: pk_positions.into_iter().map(|(_, c)| c).collect(),
        columns,
        name,
    })
}

/// One `pragma_foreign_key_list` row per column; rows sharing an `id`
/// belong to the same (possibly composite) constraint.
fn read_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) \
             ORDER BY id, seq",
        )
        .map_err(Error::introspection)?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })
        .map_err(Error::introspection)?;

    let mut grouped: BTreeMap<i64, (String, Vec<String>, Vec<Option<String>>)> = BTreeMap::new();
    for row in rows {
        let (id, target, from, to) = row.map_err(Error::introspection)?;
        let entry = grouped
            .entry(id)
            .or_insert_with(|| (target, Vec::new(), Vec::new()));
        entry.1.push(from);
        entry.2.push(to);
    }

    Ok(grouped
        .into_values()
        .map(|(referenced_table, columns, targets)| {
            // `to` is NULL when the reference points at the parent's primary key.
            let referenced_columns = if targets.iter().all(Option::is_none) {
                Vec::new()
            } else {
                targets.into_iter().map(Option::unwrap_or_default).collect()
            };
            ForeignKey {
                columns,
                referenced_table,
                referenced_columns,
            }
        })
        .collect())
}

/// Interrupts the running statement if the awaiting future goes away
/// before the blocking task finishes.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.interrupt();
        }
    }
}

pub(super) async fn run(conn: Connection, sql: &str) -> Result<RowSet> {
    let guard = InterruptOnDrop(Some(conn.get_interrupt_handle()));
    let sql = sql.to_string();
    let joined = tokio::task::spawn_blocking(move || fetch(&conn, &sql)).await;
    guard.disarm();
    joined.map_err(|e| Error::Execution(format!("query task failed: {}", e)))?
}

fn fetch(conn: &Connection, sql: &str) -> Result<RowSet> {
    let start = Instant::now();
    let mut stmt = conn.prepare(sql).map_err(execution)?;

    if stmt.column_count() == 0 {
        let affected = stmt.execute([]).map_err(execution)?;
        return Ok(RowSet {
            affected_rows: Some(affected as u64),
            elapsed: start.elapsed(),
            ..RowSet::default()
        });
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.query([]).map_err(execution)?;
    while let Some(row) = cursor.next().map_err(execution)? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(cell(row.get_ref(idx).map_err(execution)?));
        }
        rows.push(values);
    }

    Ok(RowSet {
        columns,
        rows,
        affected_rows: None,
        elapsed: start.elapsed(),
    })
}

fn cell(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Int64(i),
        ValueRef::Real(f) => CellValue::Float64(f),
        ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => CellValue::Bytes(b.to_vec()),
    }
}

fn execution(err: rusqlite::Error) -> Error {
    Error::Execution(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use tempfile::TempDir;

    fn create_db(sql: &str) -> (TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(sql).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn test_database_path() {
        assert_eq!(database_path("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(database_path("sqlite:data.db"), "data.db");
        assert_eq!(database_path(" data.db "), "data.db");
        assert_eq!(database_path("file:data.db?mode=ro"), "file:data.db?mode=ro");
    }

    #[tokio::test]
    async fn test_extract_ddl() {
        let (_dir, uri) = create_db(
            "CREATE TABLE customer (
                 customer_id INTEGER NOT NULL,
                 first_name VARCHAR(45),
                 active BOOLEAN,
                 balance DECIMAL(10,2),
                 created_at TIMESTAMP,
                 PRIMARY KEY (customer_id)
             );
             CREATE TABLE rental (
                 rental_id INTEGER PRIMARY KEY,
                 customer_id INTEGER REFERENCES customer(customer_id),
                 rental_date DATE NOT NULL
             );",
        );

        let ddl = Dialect::Sqlite(SqliteDialect).extract_ddl(&uri).await.unwrap();
        assert!(ddl.starts_with("CREATE TABLE \"customer\" (\n"));
        assert!(ddl.contains("  \"customer_id\" INTEGER NOT NULL,\n"));
        assert!(ddl.contains("  \"first_name\" TEXT,\n"));
        assert!(ddl.contains("  \"active\" BOOLEAN,\n"));
        assert!(ddl.contains("  \"balance\" REAL,\n"));
        assert!(ddl.contains("  \"created_at\" TIMESTAMP,\n"));
        assert!(ddl.contains("  PRIMARY KEY (\"customer_id\")\n);"));
        assert!(ddl.contains("  \"rental_date\" DATE NOT NULL,\n"));
        assert!(ddl.contains(
            "  FOREIGN KEY (\"customer_id\") REFERENCES \"customer\" (\"customer_id\")\n);"
        ));
        assert!(ddl.contains(");\n\nCREATE TABLE \"rental\""));
    }

    #[tokio::test]
    async fn test_composite_keys() {
        let (_dir, uri) = create_db(
            "CREATE TABLE parent (a INTEGER, b INTEGER, PRIMARY KEY (b, a));
             CREATE TABLE child (
                 x INTEGER,
                 y INTEGER,
                 FOREIGN KEY (x, y) REFERENCES parent (b, a)
             );",
        );

        let tables = SqliteDialect.read_catalog(&uri).await.unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].primary_key, vec!["b", "a"]);
        assert_eq!(tables[1].foreign_keys.len(), 1);
        let fk = &tables[1].foreign_keys[0];
        assert_eq!(fk.columns, vec!["x", "y"]);
        assert_eq!(fk.referenced_table, "parent");
        assert_eq!(fk.referenced_columns, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_untyped_column_and_implicit_reference() {
        let (_dir, uri) = create_db(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (note, parent_id INTEGER REFERENCES parent);",
        );
        let tables = SqliteDialect.read_catalog(&uri).await.unwrap();
        assert_eq!(tables[1].columns[0].native_type, "");
        assert!(tables[1].foreign_keys[0].referenced_columns.is_empty());

        let ddl = Dialect::Sqlite(SqliteDialect).extract_ddl(&uri).await.unwrap();
        assert!(ddl.contains("  \"note\" TEXT,\n"));
        assert!(ddl.contains("REFERENCES \"parent\"\n);"));
    }

    #[tokio::test]
    async fn test_empty_database() {
        let (_dir, uri) = create_db("CREATE TABLE scratch (x); DROP TABLE scratch;");
        let ddl = Dialect::Sqlite(SqliteDialect).extract_ddl(&uri).await.unwrap();
        assert_eq!(ddl, "");
    }

    #[tokio::test]
    async fn test_missing_file_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("missing.db").to_string_lossy().into_owned();
        let err = Dialect::Sqlite(SqliteDialect)
            .extract_ddl(&uri)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(!dir.path().join("missing.db").exists());
    }

    #[tokio::test]
    async fn test_run_select() {
        let (_dir, uri) = create_db(
            "CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT, score REAL, pic BLOB);
             INSERT INTO customer VALUES (1, 'Ada', 9.5, x'0102');
             INSERT INTO customer VALUES (2, NULL, NULL, NULL);",
        );
        let conn = Dialect::Sqlite(SqliteDialect).connect(&uri).await.unwrap();
        let set = conn
            .run("SELECT id, name, score, pic FROM customer ORDER BY id;")
            .await
            .unwrap();
        assert_eq!(set.columns, vec!["id", "name", "score", "pic"]);
        assert_eq!(set.row_count(), 2);
        assert_eq!(
            set.rows[0],
            vec![
                CellValue::Int64(1),
                CellValue::Text("Ada".into()),
                CellValue::Float64(9.5),
                CellValue::Bytes(vec![1, 2]),
            ]
        );
        assert_eq!(set.rows[1][1], CellValue::Null);
        assert!(set.affected_rows.is_none());
    }

    #[tokio::test]
    async fn test_run_reports_affected_rows() {
        let (_dir, uri) = create_db("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1), (2);");
        let conn = Dialect::Sqlite(SqliteDialect).connect(&uri).await.unwrap();
        let set = conn.run("UPDATE t SET id = id + 10").await.unwrap();
        assert_eq!(set.affected_rows, Some(2));
        assert!(set.columns.is_empty());
    }

    #[tokio::test]
    async fn test_run_missing_table() {
        let (_dir, uri) = create_db("CREATE TABLE customer (id INTEGER);");
        let conn = Dialect::Sqlite(SqliteDialect).connect(&uri).await.unwrap();
        let err = conn.run("SELECT * FROM orders;").await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(err.to_string().contains("no such table: orders"));
    }
}
