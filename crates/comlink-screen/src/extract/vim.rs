//! `vim` mode, file name and cursor.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

use super::Extraction;
use crate::element::{ElementType, Position};

static MODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-- (INSERT|REPLACE|VISUAL(?: LINE| BLOCK)?) --").expect("Invalid mode regex")
});
static FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("Invalid filename regex"));
static RULER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+),(\d+)(?:-\d+)?\s+(All|Top|Bot|\d+%)\s*$").expect("Invalid ruler regex")
});
static LINE_COL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+),(\d+)").expect("Invalid cursor regex"));

pub(crate) fn extract(lines: &[String], cursor: Position) -> Extraction {
    let mut extraction = Extraction::default();
    let Some(status_row) = lines.iter().rposition(|l| !l.trim().is_empty()) else {
        extraction.metadata.insert("mode".into(), json!("normal"));
        return extraction;
    };
    let status = &lines[status_row];
    extraction.retype.push((status_row, ElementType::Status));

    let mode = MODE
        .captures(status)
        .map(|c| c[1].to_ascii_lowercase())
        .unwrap_or_else(|| "normal".to_string());
    extraction.metadata.insert("mode".into(), json!(mode));

    let filename = lines
        .iter()
        .rev()
        .find_map(|l| FILENAME.captures(l).map(|c| c[1].to_string()));
    extraction.metadata.insert(
        "filename".into(),
        filename.map(Value::String).unwrap_or(Value::Null),
    );

    // Ruler first, then any "l,c" on the status line, then the terminal cursor.
    let (line, column) = RULER
        .captures(status)
        .or_else(|| LINE_COL.captures(status))
        .and_then(|c| Some((c[1].parse::<usize>().ok()?, c[2].parse::<usize>().ok()?)))
        .unwrap_or((cursor.row + 1, cursor.col + 1));
    extraction.metadata.insert("cursor_line".into(), json!(line));
    extraction.metadata.insert("cursor_column".into(), json!(column));

    let buffer: Vec<&String> = lines[..status_row]
        .iter()
        .filter(|l| l.as_str() != "~")
        .collect();
    extraction
        .metadata
        .insert("buffer_lines".into(), json!(buffer.len()));
    extraction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_insert_mode_with_ruler() {
        let l = lines("hello\nworld\n~\n~\n-- INSERT --                      2,3           All");
        let e = extract(&l, Position { row: 1, col: 2 });
        assert_eq!(e.metadata["mode"], "insert");
        assert_eq!(e.metadata["cursor_line"], 2);
        assert_eq!(e.metadata["cursor_column"], 3);
        assert_eq!(e.metadata["buffer_lines"], 2);
    }

    #[test]
    fn test_filename_from_write_message() {
        let l = lines("text\n\"notes.txt\" 1L, 5B written");
        let e = extract(&l, Position { row: 0, col: 0 });
        assert_eq!(e.metadata["mode"], "normal");
        assert_eq!(e.metadata["filename"], "notes.txt");
        assert_eq!(e.metadata["cursor_line"], 1);
        assert_eq!(e.metadata["cursor_column"], 1);
    }

    #[test]
    fn test_cursor_falls_back_to_terminal() {
        let l = lines("text\n-- VISUAL LINE --");
        let e = extract(&l, Position { row: 0, col: 3 });
        assert_eq!(e.metadata["mode"], "visual line");
        assert_eq!(e.metadata["cursor_line"], 1);
        assert_eq!(e.metadata["cursor_column"], 4);
    }
}
