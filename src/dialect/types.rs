use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Engine-neutral column categories shown to the query author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenericType {
    Text,
    Number,
    Integer,
    Boolean,
    Timestamp,
    Date,
}

impl GenericType {
    pub const ALL: [GenericType; 6] = [
        GenericType::Text,
        GenericType::Number,
        GenericType::Integer,
        GenericType::Boolean,
        GenericType::Timestamp,
        GenericType::Date,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenericType::Text => "text",
            GenericType::Number => "number",
            GenericType::Integer => "integer",
            GenericType::Boolean => "boolean",
            GenericType::Timestamp => "timestamp",
            GenericType::Date => "date",
        }
    }

    /// Classify a native type name as reported by an engine's catalog.
    ///
    /// Exact names are looked up first so that types like `interval` or
    /// `point` do not fall into the `int` substring rule; everything else
    /// goes through substring heuristics and finally defaults to `Text`.
    pub fn classify(native: &str) -> GenericType {
        let lowered = native.trim().to_lowercase();
        // varchar(255), numeric(10, 2), ...
        let base = lowered
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        if let Some(known) = canonical(&base) {
            return known;
        }
        // PostgreSQL array udt names are prefixed with an underscore.
        if base.starts_with('_') {
            return GenericType::Text;
        }
        heuristic(&base)
    }
}

impl fmt::Display for GenericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenericType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        GenericType::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered)
            .ok_or(())
    }
}

fn canonical(name: &str) -> Option<GenericType> {
    let ty = match name {
        "int" | "integer" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "tinyint"
        | "mediumint" | "serial" | "smallserial" | "bigserial" => GenericType::Integer,
        "text" | "varchar" | "char" | "character" | "character varying" | "bpchar" | "name"
        | "clob" | "citext" | "uuid" | "json" | "jsonb" | "xml" | "interval" | "point"
        | "time" | "timetz" | "time without time zone" | "time with time zone" | "blob"
        | "bytea" => GenericType::Text,
        "real" | "float" | "float4" | "float8" | "double" | "double precision" | "numeric"
        | "decimal" | "money" => GenericType::Number,
        "bool" | "boolean" => GenericType::Boolean,
        "timestamp" | "timestamptz" | "timestamp without time zone"
        | "timestamp with time zone" | "datetime" => GenericType::Timestamp,
        "date" => GenericType::Date,
        _ => return None,
    };
    Some(ty)
}

fn heuristic(name: &str) -> GenericType {
    let contains_any = |needles: &[&str]| needles.iter().any(|n| name.contains(n));

    if name.contains("int") {
        GenericType::Integer
    } else if contains_any(&["char", "text", "clob"]) {
        GenericType::Text
    } else if contains_any(&["real", "floa", "doub", "numeric", "decimal"]) {
        GenericType::Number
    } else if name.contains("bool") {
        GenericType::Boolean
    } else if name.starts_with("timestamp") {
        GenericType::Timestamp
    } else if name.contains("date") {
        GenericType::Date
    } else {
        GenericType::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_types() {
        for t in ["int", "integer", "bigint", "INT4", "unsigned big int", "int8"] {
            assert_eq!(GenericType::classify(t), GenericType::Integer, "{}", t);
        }
    }

    #[test]
    fn test_text_types() {
        for t in [
            "char",
            "character",
            "varchar",
            "character varying(20)",
            "text",
            "NVARCHAR(100)",
            "clob",
        ] {
            assert_eq!(GenericType::classify(t), GenericType::Text, "{}", t);
        }
    }

    #[test]
    fn test_number_types() {
        for t in [
            "numeric",
            "decimal(10,2)",
            "real",
            "float",
            "double precision",
            "DOUBLE",
        ] {
            assert_eq!(GenericType::classify(t), GenericType::Number, "{}", t);
        }
    }

    #[test]
    fn test_temporal_and_boolean_types() {
        assert_eq!(GenericType::classify("timestamp"), GenericType::Timestamp);
        assert_eq!(
            GenericType::classify("timestamp without time zone"),
            GenericType::Timestamp
        );
        assert_eq!(GenericType::classify("timestamp(3)"), GenericType::Timestamp);
        assert_eq!(GenericType::classify("date"), GenericType::Date);
        assert_eq!(GenericType::classify("bool"), GenericType::Boolean);
        assert_eq!(GenericType::classify("boolean"), GenericType::Boolean);
    }

    #[test]
    fn test_canonical_table_beats_substring_rules() {
        assert_eq!(GenericType::classify("interval"), GenericType::Text);
        assert_eq!(GenericType::classify("point"), GenericType::Text);
        assert_eq!(GenericType::classify("_int4"), GenericType::Text);
    }

    #[test]
    fn test_unknown_defaults_to_text() {
        assert_eq!(GenericType::classify("unknown_type"), GenericType::Text);
        assert_eq!(GenericType::classify(""), GenericType::Text);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("NUMBER".parse::<GenericType>(), Ok(GenericType::Number));
        assert_eq!(" date ".parse::<GenericType>(), Ok(GenericType::Date));
        assert!("unknown_type".parse::<GenericType>().is_err());
    }
}
