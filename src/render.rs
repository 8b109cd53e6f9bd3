use std::fmt;
use std::str::FromStr;

use unicode_width::UnicodeWidthStr;

use crate::rows::{CellValue, RowSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Table => "table",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        })
    }
}

pub fn render(rows: &RowSet, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => to_table(rows),
        OutputFormat::Json => to_json(rows),
        OutputFormat::Csv => to_csv(rows),
    }
}

/// psql-style aligned table with a row-count footer. Numbers are right
/// aligned, everything else left aligned.
pub fn to_table(rows: &RowSet) -> String {
    if rows.columns.is_empty() {
        let affected = rows.affected_rows.unwrap_or(0);
        return format!("({} {} affected)\n", affected, plural(affected as usize));
    }

    let mut widths: Vec<usize> = rows.columns.iter().map(|c| c.width()).collect();
    for row in &rows.rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.display_width());
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = rows
        .columns
        .iter()
        .zip(&widths)
        .map(|(name, &w)| pad_left_aligned(name, w))
        .collect();
    out.push_str(&format!(" {} \n", header.join(" | ")));
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w + 2)).collect();
    out.push_str(&rule.join("+"));
    out.push('\n');

    for row in &rows.rows {
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| {
                let text = cell.display();
                if is_numeric(cell) {
                    pad_right_aligned(&text, w)
                } else {
                    pad_left_aligned(&text, w)
                }
            })
            .collect();
        out.push_str(&format!(" {} \n", cells.join(" | ")));
    }

    out.push_str(&format!("({} {})\n", rows.row_count(), plural(rows.row_count())));
    out
}

pub fn to_json(rows: &RowSet) -> String {
    let objects: Vec<serde_json::Value> = rows
        .rows
        .iter()
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for (i, cell) in row.iter().enumerate() {
                let name = rows
                    .columns
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("column_{}", i));
                obj.insert(name, cell_to_json(cell));
            }
            serde_json::Value::Object(obj)
        })
        .collect();

    serde_json::to_string_pretty(&objects).unwrap_or_else(|_| "[]".to_string())
}

pub fn to_csv(rows: &RowSet) -> String {
    let mut out = String::new();
    let header: Vec<String> = rows.columns.iter().map(|c| csv_escape(c)).collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for row in &rows.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| match cell {
                CellValue::Null => String::new(),
                other => csv_escape(&other.display()),
            })
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn cell_to_json(cell: &CellValue) -> serde_json::Value {
    match cell {
        CellValue::Null => serde_json::Value::Null,
        CellValue::Bool(b) => serde_json::Value::Bool(*b),
        CellValue::Int16(i) => serde_json::json!(*i),
        CellValue::Int32(i) => serde_json::json!(*i),
        CellValue::Int64(i) => serde_json::json!(*i),
        CellValue::Float32(f) => serde_json::json!(*f),
        CellValue::Float64(f) => serde_json::json!(*f),
        CellValue::Json(j) => j.clone(),
        CellValue::Array(items) => serde_json::Value::Array(items.iter().map(cell_to_json).collect()),
        other => serde_json::Value::String(other.display()),
    }
}

fn is_numeric(cell: &CellValue) -> bool {
    matches!(
        cell,
        CellValue::Int16(_)
            | CellValue::Int32(_)
            | CellValue::Int64(_)
            | CellValue::Float32(_)
            | CellValue::Float64(_)
    )
}

fn pad_left_aligned(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(text.width());
    format!("{}{}", text, " ".repeat(fill))
}

fn pad_right_aligned(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(text.width());
    format!("{}{}", " ".repeat(fill), text)
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        "row"
    } else {
        "rows"
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
