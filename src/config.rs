use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_ITERATIONS: usize = 3;
pub const DEFAULT_PG_SCHEMA: &str = "public";

/// Database engines with a concrete dialect adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialectKind {
    #[default]
    Sqlite,
    Postgres,
}

impl DialectKind {
    pub fn name(&self) -> &'static str {
        match self {
            DialectKind::Sqlite => "sqlite",
            DialectKind::Postgres => "postgresql",
        }
    }
}

impl FromStr for DialectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(DialectKind::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(DialectKind::Postgres),
            other => Err(Error::configuration(format!(
                "Unsupported DB_DIALECT: {}",
                other
            ))),
        }
    }
}

/// Runtime settings, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub dialect: DialectKind,
    pub db_uri: Option<String>,
    pub max_iterations: usize,
    /// Upper bound on a single execution call.
    pub query_timeout: Option<Duration>,
    /// Upper bound on a single wait for the corrector.
    pub correction_timeout: Option<Duration>,
    /// Catalog schema introspected by the PostgreSQL dialect.
    pub pg_schema: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dialect: DialectKind::default(),
            db_uri: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            query_timeout: None,
            correction_timeout: None,
            pg_schema: DEFAULT_PG_SCHEMA.to_string(),
        }
    }
}

/// On-disk form of [`Settings`]. Every field is optional so a file can
/// override just what it needs.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    dialect: Option<String>,
    db_uri: Option<String>,
    max_iterations: Option<usize>,
    query_timeout_secs: Option<u64>,
    correction_timeout_secs: Option<u64>,
    pg_schema: Option<String>,
}

impl Settings {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlmend")
            .join("config.toml")
    }

    /// Resolve settings from defaults, an optional TOML file and the process
    /// environment (highest precedence).
    ///
    /// A missing file at the default location is not an error; a missing
    /// file that was asked for explicitly is.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut settings = Settings::default();

        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);
        if explicit_path.is_some() || path.exists() {
            settings.apply_file(&path)?;
        }

        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.check()?;
        Ok(settings)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        self.apply_toml(&content).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    fn apply_toml(&mut self, content: &str) -> Result<()> {
        let file: SettingsFile =
            toml::from_str(content).map_err(|e| Error::configuration(e.to_string()))?;

        if let Some(dialect) = file.dialect {
            self.dialect = dialect.parse()?;
        }
        if let Some(uri) = file.db_uri {
            self.db_uri = non_empty(uri);
        }
        if let Some(n) = file.max_iterations {
            self.max_iterations = n;
        }
        if let Some(secs) = file.query_timeout_secs {
            self.query_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = file.correction_timeout_secs {
            self.correction_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(schema) = file.pg_schema {
            self.pg_schema = schema;
        }
        Ok(())
    }

    /// Overlay environment variables. `lookup` is injected so tests do not
    /// have to mutate the real process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dialect) = lookup("DB_DIALECT").and_then(non_empty) {
            self.dialect = dialect.parse()?;
        }
        if let Some(uri) = lookup("DB_URI") {
            self.db_uri = non_empty(uri);
        }
        if let Some(n) = lookup("SQLMEND_MAX_ITERATIONS").and_then(non_empty) {
            self.max_iterations = parse_number("SQLMEND_MAX_ITERATIONS", &n)?;
        }
        if let Some(secs) = lookup("SQLMEND_QUERY_TIMEOUT_SECS").and_then(non_empty) {
            self.query_timeout = Some(Duration::from_secs(parse_number(
                "SQLMEND_QUERY_TIMEOUT_SECS",
                &secs,
            )?));
        }
        if let Some(secs) = lookup("SQLMEND_CORRECTION_TIMEOUT_SECS").and_then(non_empty) {
            self.correction_timeout = Some(Duration::from_secs(parse_number(
                "SQLMEND_CORRECTION_TIMEOUT_SECS",
                &secs,
            )?));
        }
        if let Some(schema) = lookup("SQLMEND_PG_SCHEMA").and_then(non_empty) {
            self.pg_schema = schema;
        }
        Ok(())
    }

    pub fn check(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::configuration("max_iterations must be at least 1"));
        }
        if self.pg_schema.trim().is_empty() {
            return Err(Error::configuration("pg_schema must not be empty"));
        }
        Ok(())
    }

    /// The configured URI, or the configuration error reported when it is
    /// absent.
    pub fn require_uri(&self) -> Result<&str> {
        self.db_uri
            .as_deref()
            .ok_or_else(|| Error::configuration("DB_URI environment variable not set."))
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("{} must be a number, got {:?}", key, value)))
}
