use serde::Serialize;
use sqlparser::ast::{DataType, Statement};
use sqlparser::dialect::Dialect as SqlGrammar;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::{debug, warn};

use super::{StructuredSchema, TableSchema};

/// Type recorded for columns declared without one.
pub const UNKNOWN_TYPE: &str = "UNKNOWN";

/// A statement the parser had to skip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DdlDiagnostic {
    pub statement: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSchema {
    pub schema: StructuredSchema,
    pub diagnostics: Vec<DdlDiagnostic>,
}

/// Build a [`StructuredSchema`] from raw DDL text.
///
/// Statements are parsed one at a time so a single malformed statement only
/// costs its own table. Anything other than `CREATE TABLE` with a column
/// list is ignored.
pub fn parse_ddl(raw: &str, grammar: &dyn SqlGrammar) -> ParsedSchema {
    let mut parsed = ParsedSchema::default();

    for statement in split_statements(raw, grammar) {
        let text = statement.trim();
        if text.is_empty() {
            continue;
        }

        match Parser::parse_sql(grammar, text) {
            Ok(statements) => {
                for stmt in statements {
                    if let Some(table) = table_from_statement(stmt) {
                        parsed.schema.insert_table(table);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, statement = text, "skipping unparseable DDL statement");
                parsed.diagnostics.push(DdlDiagnostic {
                    statement: text.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    debug!(
        tables = parsed.schema.len(),
        skipped = parsed.diagnostics.len(),
        "parsed DDL"
    );
    parsed
}

fn table_from_statement(stmt: Statement) -> Option<TableSchema> {
    let Statement::CreateTable(create) = stmt else {
        return None;
    };
    // CREATE TABLE ... AS SELECT has no column definitions to record.
    if create.columns.is_empty() {
        return None;
    }

    let name = create.name.0.last()?.value.clone();
    let mut table = TableSchema::new(name);
    for column in create.columns {
        let data_type = match column.data_type {
            DataType::Unspecified => UNKNOWN_TYPE.to_string(),
            other => {
                let text = other.to_string();
                if text.trim().is_empty() {
                    UNKNOWN_TYPE.to_string()
                } else {
                    text
                }
            }
        };
        table.push_column(column.name.value, data_type);
    }
    Some(table)
}

/// Split on statement-terminating semicolons. Semicolons inside string
/// literals, quoted identifiers and comments are part of their token and do
/// not split. Text the tokenizer rejects is split naively.
fn split_statements(raw: &str, grammar: &dyn SqlGrammar) -> Vec<String> {
    let tokens = match Tokenizer::new(grammar, raw).with_unescape(false).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(error = %e, "DDL tokenization failed, splitting on ';'");
            return raw.split(';').map(str::to_string).collect();
        }
    };

    let mut statements = Vec::new();
    let mut current = String::new();
    for token in tokens {
        match token {
            Token::SemiColon => statements.push(std::mem::take(&mut current)),
            Token::EOF => {}
            other => current.push_str(&other.to_string()),
        }
    }
    statements.push(current);
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};

    const SAMPLE_DDL: &str = r#"CREATE TABLE "customer" (
  "customer_id" INTEGER NOT NULL,
  "first_name" TEXT NOT NULL,
  "email" TEXT,
  PRIMARY KEY ("customer_id")
);

CREATE TABLE "rental" (
  "rental_id" INTEGER NOT NULL,
  "rental_date" TIMESTAMP NOT NULL,
  "customer_id" INTEGER NOT NULL,
  PRIMARY KEY ("rental_id"),
  FOREIGN KEY ("customer_id") REFERENCES "customer" ("customer_id")
);"#;

    fn columns(parsed: &ParsedSchema, table: &str) -> Vec<(String, String)> {
        parsed
            .schema
            .table(table)
            .unwrap()
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type.clone()))
            .collect()
    }

    #[test]
    fn test_parse_extracted_ddl() {
        let parsed = parse_ddl(SAMPLE_DDL, &PostgreSqlDialect {});
        assert_eq!(parsed.schema.len(), 2);
        assert!(parsed.diagnostics.is_empty());
        assert_eq!(
            columns(&parsed, "customer"),
            vec![
                ("customer_id".to_string(), "INTEGER".to_string()),
                ("first_name".to_string(), "TEXT".to_string()),
                ("email".to_string(), "TEXT".to_string()),
            ]
        );
        assert_eq!(columns(&parsed, "rental")[1].1, "TIMESTAMP");
    }

    #[test]
    fn test_malformed_statement_is_skipped() {
        let ddl = "CREATE TABLE a (id INTEGER);\nCREATE GARBAGE SYNTAX;\nCREATE TABLE b (x TEXT);";
        let parsed = parse_ddl(ddl, &SQLiteDialect {});
        assert_eq!(parsed.schema.len(), 2);
        assert!(parsed.schema.contains_table("a"));
        assert!(parsed.schema.contains_table("b"));
        assert_eq!(parsed.diagnostics.len(), 1);
        assert_eq!(parsed.diagnostics[0].statement, "CREATE GARBAGE SYNTAX");
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_ddl("", &SQLiteDialect {}).schema.is_empty());
        assert!(parse_ddl("  \n ", &SQLiteDialect {}).schema.is_empty());
    }

    #[test]
    fn test_qualified_name_uses_last_part() {
        let parsed = parse_ddl(
            r#"CREATE TABLE "sales"."orders" (id INTEGER, total NUMERIC(10,2));"#,
            &PostgreSqlDialect {},
        );
        assert!(parsed.schema.contains_table("orders"));
        assert_eq!(columns(&parsed, "orders")[1].1, "NUMERIC(10,2)");
    }

    #[test]
    fn test_untyped_column_is_unknown() {
        let parsed = parse_ddl("CREATE TABLE t (a, b INTEGER);", &SQLiteDialect {});
        assert_eq!(
            columns(&parsed, "t"),
            vec![
                ("a".to_string(), UNKNOWN_TYPE.to_string()),
                ("b".to_string(), "INTEGER".to_string()),
            ]
        );
    }

    #[test]
    fn test_non_table_statements_ignored() {
        let ddl = "CREATE INDEX idx ON t (a);\nCREATE VIEW v AS SELECT 1;\nCREATE TABLE c AS SELECT 1 AS x;";
        let parsed = parse_ddl(ddl, &SQLiteDialect {});
        assert!(parsed.schema.is_empty());
        assert!(parsed.diagnostics.is_empty());
    }

    #[test]
    fn test_semicolon_inside_literal_does_not_split() {
        let ddl = "CREATE TABLE t (note TEXT DEFAULT 'a;''b', \"odd;name\" INTEGER);\nCREATE TABLE u (id INTEGER);";
        let parsed = parse_ddl(ddl, &SQLiteDialect {});
        assert!(parsed.diagnostics.is_empty());
        assert_eq!(parsed.schema.len(), 2);
        assert!(parsed.schema.table("t").unwrap().has_column("odd;name"));
    }

    #[test]
    fn test_duplicate_create_overwrites() {
        let ddl = "CREATE TABLE t (a INTEGER);\nCREATE TABLE t (b TEXT);";
        let parsed = parse_ddl(ddl, &SQLiteDialect {});
        assert_eq!(columns(&parsed, "t"), vec![("b".to_string(), "TEXT".to_string())]);
    }

    #[test]
    fn test_unterminated_literal_falls_back_to_naive_split() {
        let ddl = "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (x TEXT DEFAULT 'oops);";
        let parsed = parse_ddl(ddl, &SQLiteDialect {});
        assert!(parsed.schema.contains_table("a"));
        assert_eq!(parsed.diagnostics.len(), 1);
    }
}
