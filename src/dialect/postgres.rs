use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};

use postgres_native_tls::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::ErrorPosition;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, warn};

use super::{CatalogColumn, CatalogTable, ForeignKey, GenericType};
use crate::error::{Error, Result};
use crate::rows::{CellValue, RowSet};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Client/server engine introspected through `information_schema`.
#[derive(Clone)]
pub struct PostgresDialect {
    schema: String,
    /// Used when the connection URI carries no password of its own.
    password: Option<String>,
}

impl fmt::Debug for PostgresDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDialect")
            .field("schema", &self.schema)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub(super) fn map_generic_type(ty: GenericType) -> &'static str {
    match ty {
        GenericType::Text => "TEXT",
        GenericType::Number => "NUMERIC",
        GenericType::Integer => "INTEGER",
        GenericType::Boolean => "BOOLEAN",
        GenericType::Timestamp => "TIMESTAMP",
        GenericType::Date => "DATE",
    }
}

impl PostgresDialect {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            password: None,
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(password.into());
    }

    /// Accepts both `postgres://` URLs and `key=value` connection strings.
    pub(super) async fn connect(&self, uri: &str) -> Result<PgSession> {
        let mut config: Config = uri
            .parse()
            .map_err(|e: tokio_postgres::Error| Error::connection(e))?;
        if config.get_password().is_none() {
            if let Some(password) = &self.password {
                config.password(password.as_str());
            }
        }

        let (client, driver) = match config.get_ssl_mode() {
            SslMode::Disable => {
                let (client, connection) =
                    tokio::time::timeout(CONNECT_TIMEOUT, config.connect(NoTls))
                        .await
                        .map_err(|_| connect_timed_out())?
                        .map_err(|e| Error::connection(describe_pg_error(&e, "")))?;
                let driver = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(error = %e, "postgres connection closed with error");
                    }
                });
                (client, driver)
            }
            _ => {
                // prefer/require: encrypt without verifying the chain, as libpq does.
                let tls = build_tls_connector()?;
                let (client, connection) =
                    tokio::time::timeout(CONNECT_TIMEOUT, config.connect(tls))
                        .await
                        .map_err(|_| connect_timed_out())?
                        .map_err(|e| Error::connection(describe_pg_error(&e, "")))?;
                let driver = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(error = %e, "postgres connection closed with error");
                    }
                });
                (client, driver)
            }
        };

        Ok(PgSession { client, driver })
    }

    pub(super) async fn read_catalog(&self, uri: &str) -> Result<Vec<CatalogTable>> {
        let session = self.connect(uri).await?;
        let client = &session.client;
        let schema = self.schema.as_str();

        let names: Vec<String> = client
            .query(
                r#"
                SELECT table_name::text
                FROM information_schema.tables
                WHERE table_schema = $1::text AND table_type = 'BASE TABLE'
                ORDER BY table_name
                "#,
                &[&schema],
            )
            .await
            .map_err(introspection)?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            tables.push(CatalogTable {
                columns: get_columns(client, schema, &name).await?,
                primary_key: get_primary_key(client, schema, &name).await?,
                foreign_keys: get_foreign_keys(client, schema, &name).await?,
                name,
            });
        }
        debug!(schema, tables = tables.len(), "read postgres catalog");
        Ok(tables)
    }
}

fn connect_timed_out() -> Error {
    Error::connection(format!(
        "timed out after {}s",
        CONNECT_TIMEOUT.as_secs()
    ))
}

fn build_tls_connector() -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| Error::connection(format!("failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

async fn get_columns(client: &Client, schema: &str, table: &str) -> Result<Vec<CatalogColumn>> {
    let rows = client
        .query(
            r#"
            SELECT
                column_name::text,
                udt_name::text,
                is_nullable = 'NO' AS not_null
            FROM information_schema.columns
            WHERE table_schema = $1::text AND table_name = $2::text
            ORDER BY ordinal_position
            "#,
            &[&schema, &table],
        )
        .await
        .map_err(introspection)?;

    Ok(rows
        .iter()
        .map(|row| CatalogColumn {
            name: row.get(0),
            native_type: row.get(1),
            not_null: row.get(2),
        })
        .collect())
}

async fn get_primary_key(client: &Client, schema: &str, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
                AND tc.table_name = kcu.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
              AND tc.table_schema = $1::text
              AND tc.table_name = $2::text
            ORDER BY kcu.ordinal_position
            "#,
            &[&schema, &table],
        )
        .await
        .map_err(introspection)?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Referencing and referenced columns are paired through
/// `position_in_unique_constraint`, so composite keys keep their order.
async fn get_foreign_keys(client: &Client, schema: &str, table: &str) -> Result<Vec<ForeignKey>> {
    let rows = client
        .query(
            r#"
            SELECT
                kcu.constraint_name::text,
                kcu.column_name::text,
                rkcu.table_name::text,
                rkcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
                AND tc.table_name = kcu.table_name
            JOIN information_schema.referential_constraints rc
                ON rc.constraint_name = tc.constraint_name
                AND rc.constraint_schema = tc.table_schema
            JOIN information_schema.key_column_usage rkcu
                ON rkcu.constraint_name = rc.unique_constraint_name
                AND rkcu.constraint_schema = rc.unique_constraint_schema
                AND rkcu.ordinal_position = kcu.position_in_unique_constraint
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1::text
              AND tc.table_name = $2::text
            ORDER BY kcu.constraint_name, kcu.ordinal_position
            "#,
            &[&schema, &table],
        )
        .await
        .map_err(introspection)?;

    let mut grouped: BTreeMap<String, ForeignKey> = BTreeMap::new();
    for row in &rows {
        let constraint: String = row.get(0);
        let fk = grouped.entry(constraint).or_insert_with(|| ForeignKey {
            columns: Vec::new(),
            referenced_table: row.get(2),
            referenced_columns: Vec::new(),
        });
        fk.columns.push(row.get(1));
        fk.referenced_columns.push(row.get(3));
    }
    Ok(grouped.into_values().collect())
}

fn introspection(err: tokio_postgres::Error) -> Error {
    Error::introspection(describe_pg_error(&err, ""))
}

/// One open client plus the task driving its socket. Dropping the session
/// closes the connection.
#[derive(Debug)]
pub struct PgSession {
    client: Client,
    driver: JoinHandle<()>,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl PgSession {
    pub(super) async fn run(self, sql: &str) -> Result<RowSet> {
        let start = Instant::now();
        let failed = |e: tokio_postgres::Error| Error::Execution(describe_pg_error(&e, sql));

        let statement = self.client.prepare(sql).await.map_err(failed)?;
        if statement.columns().is_empty() {
            let affected = self.client.execute(&statement, &[]).await.map_err(failed)?;
            return Ok(RowSet {
                affected_rows: Some(affected),
                elapsed: start.elapsed(),
                ..RowSet::default()
            });
        }

        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = self.client.query(&statement, &[]).await.map_err(failed)?;
        let rows = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, col)| extract_value(row, i, col.type_()))
                    .collect()
            })
            .collect();

        Ok(RowSet {
            columns,
            rows,
            affected_rows: None,
            elapsed: start.elapsed(),
        })
    }
}

/// Server error text for the corrector: the primary message followed by
/// whatever position, SQLSTATE, detail and hint the server supplied.
pub(crate) fn describe_pg_error(err: &tokio_postgres::Error, query: &str) -> String {
    let Some(db_err) = err.as_db_error() else {
        return match err.source() {
            Some(source) => format!("{}: {}", err, source),
            None => err.to_string(),
        };
    };

    let mut lines = vec![db_err.message().to_string()];
    if let Some(ErrorPosition::Original(pos)) = db_err.position() {
        let (line, col) = byte_offset_to_line_col(query, *pos as usize);
        lines.push(format!("  at line {}, column {}", line, col));
    }
    lines.push(format!("  SQLSTATE: {}", db_err.code().code()));
    if let Some(detail) = db_err.detail() {
        lines.push(format!("  Detail: {}", detail));
    }
    if let Some(hint) = db_err.hint() {
        lines.push(format!("  Hint: {}", hint));
    }
    lines.join("\n")
}

/// PostgreSQL positions are 1-based character offsets.
fn byte_offset_to_line_col(query: &str, pos: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for ch in query.chars().take(pos.saturating_sub(1)) {
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => get(row, idx, CellValue::Bool),
        Type::INT2 => get(row, idx, CellValue::Int16),
        Type::INT4 => get(row, idx, CellValue::Int32),
        Type::INT8 => get(row, idx, CellValue::Int64),
        Type::OID => get(row, idx, |v: u32| CellValue::Int64(v.into())),
        Type::FLOAT4 => get(row, idx, CellValue::Float32),
        Type::FLOAT8 => get(row, idx, CellValue::Float64),
        Type::NUMERIC => get(row, idx, |n: NumericText| CellValue::Text(n.0)),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR => get(row, idx, CellValue::Text),
        Type::CHAR => get(row, idx, |c: i8| CellValue::Text((c as u8 as char).to_string())),
        Type::BYTEA => get(row, idx, CellValue::Bytes),
        Type::DATE => get(row, idx, CellValue::Date),
        Type::TIME => get(row, idx, CellValue::Time),
        Type::TIMESTAMP => get(row, idx, CellValue::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, CellValue::TimestampTz),
        Type::JSON | Type::JSONB => get(row, idx, CellValue::Json),
        Type::BOOL_ARRAY => array(row, idx, CellValue::Bool),
        Type::INT2_ARRAY => array(row, idx, CellValue::Int16),
        Type::INT4_ARRAY => array(row, idx, CellValue::Int32),
        Type::INT8_ARRAY => array(row, idx, CellValue::Int64),
        Type::FLOAT8_ARRAY => array(row, idx, CellValue::Float64),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => array(row, idx, CellValue::Text),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .or_else(|| row.try_get::<_, Option<Opaque>>(idx).ok().flatten().map(|o| o.0))
            .unwrap_or(CellValue::Null),
    }
}

fn get<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> CellValue
where
    T: FromSql<'a>,
    F: FnOnce(T) -> CellValue,
{
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(CellValue::Null)
}

fn array<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> CellValue
where
    T: FromSql<'a>,
    F: Fn(T) -> CellValue,
{
    row.try_get::<_, Option<Vec<Option<T>>>>(idx)
        .ok()
        .flatten()
        .map(|items| {
            CellValue::Array(
                items
                    .into_iter()
                    .map(|item| item.map(&wrap).unwrap_or(CellValue::Null))
                    .collect(),
            )
        })
        .unwrap_or(CellValue::Null)
}

/// NUMERIC rendered exactly, without a lossy detour through `f64`.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(NumericText)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digits.
fn decode_numeric(raw: &[u8]) -> std::result::Result<String, Box<dyn StdError + Sync + Send>> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }
    let word = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    let ndigits = word(0) as usize;
    let weight = word(2) as i16 as i32;
    let sign = word(4);
    let dscale = word(6) as usize;
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric value truncated".into());
    }

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + i * 2)).collect();
    let digit_at = |idx: i32| -> u16 {
        if idx < 0 {
            0
        } else {
            digits.get(idx as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit_at(0).to_string());
        for idx in 1..=weight {
            out.push_str(&format!("{:04}", digit_at(idx)));
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit_at(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

/// Fallback for non-null values of types without a dedicated decoder.
struct Opaque(CellValue);

impl<'a> FromSql<'a> for Opaque {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        let value = if matches!(ty.kind(), Kind::Enum(_)) {
            CellValue::Text(String::from_utf8_lossy(raw).into_owned())
        } else if *ty == Type::UUID && raw.len() == 16 {
            CellValue::Text(format_uuid(raw))
        } else {
            CellValue::Unknown(format!("<{}>", ty.name()))
        };
        Ok(Opaque(value))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn format_uuid(raw: &[u8]) -> String {
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ndigits.to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        assert_eq!(decode_numeric(&numeric(2, 0, 0, 2, &[123, 4500])).unwrap(), "123.45");
        assert_eq!(decode_numeric(&numeric(1, -1, 0, 3, &[10])).unwrap(), "0.001");
        assert_eq!(decode_numeric(&numeric(1, 1, 0, 0, &[1])).unwrap(), "10000");
        assert_eq!(
            decode_numeric(&numeric(2, 1, NUMERIC_NEG, 1, &[12, 3456])).unwrap(),
            "-123456.0"
        );
        assert_eq!(decode_numeric(&numeric(0, 0, 0, 0, &[])).unwrap(), "0");
        assert_eq!(decode_numeric(&numeric(0, 0, 0, 2, &[])).unwrap(), "0.00");
    }

    #[test]
    fn test_decode_numeric_special_values() {
        assert_eq!(decode_numeric(&numeric(0, 0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert_eq!(
            decode_numeric(&numeric(0, 0, NUMERIC_NINF, 0, &[])).unwrap(),
            "-Infinity"
        );
    }

    #[test]
    fn test_decode_numeric_rejects_short_input() {
        assert!(decode_numeric(&[0, 1]).is_err());
        assert!(decode_numeric(&numeric(3, 0, 0, 0, &[1])).is_err());
    }

    #[test]
    fn test_format_uuid() {
        let raw: Vec<u8> = (0u8..16).collect();
        assert_eq!(format_uuid(&raw), "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn test_byte_offset_to_line_col() {
        assert_eq!(byte_offset_to_line_col("SELECT 1", 1), (1, 1));
        assert_eq!(byte_offset_to_line_col("SELECT *\nFROM t,,", 16), (2, 7));
        assert_eq!(byte_offset_to_line_col("", 5), (1, 1));
    }

    #[test]
    fn test_postgres_mapping() {
        assert_eq!(map_generic_type(GenericType::Number), "NUMERIC");
        assert_eq!(map_generic_type(GenericType::Integer), "INTEGER");
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut d = PostgresDialect::new("public");
        d.set_password("hunter2");
        let printed = format!("{:?}", d);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("public"));
    }

    #[tokio::test]
    async fn test_invalid_uri_is_connection_error() {
        let err = PostgresDialect::new("public")
            .connect("postgres://localhost:notaport/db")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
