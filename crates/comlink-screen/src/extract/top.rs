//! `top` summary header and process table.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

use super::Extraction;
use crate::element::{ElementType, Position, ScreenElement, Size};

static LOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"load average:\s*([\d.]+),?\s*([\d.]+),?\s*([\d.]+)").expect("Invalid load regex")
});
static TASKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tasks:\s*(\d+)\s*total,\s*(\d+)\s*running").expect("Invalid tasks regex")
});
static CPU: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%?Cpu\(s\):\s*([\d.]+)%?\s*us").expect("Invalid cpu regex")
});
static MEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([KMG]iB)\s*Mem\s*:\s*([\d.]+)\s*total,\s*([\d.]+)\s*free")
        .expect("Invalid mem regex")
});

fn number(s: &str) -> Value {
    s.parse::<f64>().map(|n| json!(n)).unwrap_or(Value::Null)
}

fn summary(lines: &[String]) -> Map<String, Value> {
    let mut out = Map::new();
    for line in lines {
        if let Some(c) = LOAD.captures(line) {
            out.insert(
                "load_average".into(),
                json!([number(&c[1]), number(&c[2]), number(&c[3])]),
            );
        }
        if let Some(c) = TASKS.captures(line) {
            out.insert("tasks_total".into(), number(&c[1]));
            out.insert("tasks_running".into(), number(&c[2]));
        }
        if let Some(c) = CPU.captures(line) {
            out.insert("cpu_user".into(), number(&c[1]));
        }
        if let Some(c) = MEM.captures(line) {
            out.insert("mem_unit".into(), json!(&c[1]));
            out.insert("mem_total".into(), number(&c[2]));
            out.insert("mem_free".into(), number(&c[3]));
        }
    }
    out
}

fn is_header(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    tokens.next() == Some("PID") && tokens.count() >= 2
}

/// Splits a process row against the header columns.
///
/// The last column (the command) may contain spaces and takes the rest of
/// the row. Rows with fewer fields than columns are partial redraws and
/// are skipped.
fn split_row(line: &str, columns: &[String]) -> Option<Map<String, Value>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < columns.len() || !tokens[0].chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let last = columns.len() - 1;
    let mut row = Map::new();
    for (i, column) in columns.iter().enumerate() {
        let value = if i == last {
            tokens[last..].join(" ")
        } else {
            tokens[i].to_string()
        };
        row.insert(column.clone(), Value::String(value));
    }
    Some(row)
}

pub(crate) fn extract(lines: &[String]) -> Extraction {
    let mut extraction = Extraction::default();
    extraction
        .metadata
        .insert("summary".into(), Value::Object(summary(lines)));

    let Some(header_row) = lines.iter().position(|l| is_header(l)) else {
        return extraction;
    };
    let columns: Vec<String> = lines[header_row]
        .split_whitespace()
        .map(str::to_string)
        .collect();
    extraction.retype.push((header_row, ElementType::TableHeader));

    let mut rows = Vec::new();
    let mut last_row = header_row;
    for (offset, line) in lines[header_row + 1..].iter().enumerate() {
        if line.trim().is_empty() {
            break;
        }
        let row = header_row + 1 + offset;
        if let Some(parsed) = split_row(line, &columns) {
            extraction.retype.push((row, ElementType::Row));
            rows.push(Value::Object(parsed));
            last_row = row;
        }
    }

    let width = lines[header_row..=last_row]
        .iter()
        .map(|l| l.chars().count())
        .max()
        .unwrap_or(0);
    extraction.extra.push(ScreenElement {
        element_type: ElementType::Table,
        content: lines[header_row..=last_row].join("\n"),
        position: Position {
            row: header_row,
            col: 0,
        },
        size: Size {
            rows: last_row - header_row + 1,
            cols: width,
        },
    });

    extraction
        .metadata
        .insert("process_count".into(), json!(rows.len()));
    extraction.metadata.insert(
        "table".into(),
        json!({ "columns": columns, "rows": rows }),
    );
    extraction
}
