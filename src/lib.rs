//! Schema-aware validation, execution and bounded self-correction for
//! generated SQL.
//!
//! A [`Engine`] owns one [`dialect::Dialect`] and a per-URI
//! [`schema::SchemaCache`]. Each turn validates a candidate query against
//! the cached schema, executes it only when validation passes, and asks a
//! [`correction::Corrector`] for a revised candidate on failure, up to a
//! fixed number of iterations.
pub mod candidate;
pub mod config;
pub mod correction;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod execute;
pub mod render;
pub mod rows;
pub mod schema;
pub mod validate;

pub use config::{DialectKind, Settings};
pub use engine::{Engine, SqlSession};
pub use error::{Error, Result};
