use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;

/// A single fetched value, normalized across drivers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<CellValue>),
    /// Placeholder for values of a type no decoder handles.
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display()).collect();
                format!("{{{}}}", items.join(", "))
            }
            CellValue::Unknown(s) => s.clone(),
        }
    }

    pub fn display_width(&self) -> usize {
        unicode_width::UnicodeWidthStr::width(self.display().as_str())
    }
}

/// Rows returned by a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Set for statements that report a change count instead of rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl RowSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_display() {
        assert_eq!(CellValue::Null.display(), "NULL");
        assert_eq!(CellValue::Bool(false).display(), "false");
        assert_eq!(CellValue::Int64(9_999_999).display(), "9999999");
        assert_eq!(CellValue::Float64(2.5).display(), "2.5");
        assert_eq!(CellValue::Text("hello".into()).display(), "hello");
        assert_eq!(CellValue::Bytes(vec![1, 2, 3]).display(), "[3 bytes]");
    }

    #[test]
    fn test_array_display() {
        let arr = CellValue::Array(vec![CellValue::Int32(1), CellValue::Null]);
        assert_eq!(arr.display(), "{1, NULL}");
    }

    #[test]
    fn test_unknown_display() {
        assert_eq!(CellValue::Unknown("<tsvector>".into()).display(), "<tsvector>");
    }

    #[test]
    fn test_display_width_counts_wide_chars() {
        assert_eq!(CellValue::Text("日本".into()).display_width(), 4);
        assert_eq!(CellValue::Null.display_width(), 4);
    }

    #[test]
    fn test_serialize_untagged() {
        let set = RowSet {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![CellValue::Int64(1), CellValue::Null]],
            affected_rows: None,
            elapsed: Duration::from_millis(12),
        };
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["rows"][0][0], 1);
        assert!(json["rows"][0][1].is_null());
        assert_eq!(json["elapsed_ms"], 12);
        assert!(json.get("affected_rows").is_none());
    }
}
