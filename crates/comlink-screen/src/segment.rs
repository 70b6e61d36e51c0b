//! Splits grid lines into classified elements.

use regex::Regex;
use std::sync::LazyLock;

use crate::element::{ElementType, Position, ScreenElement, Size};

/// Runs of this many blanks or more separate two regions on one row.
const REGION_GAP: usize = 4;

static SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s\-\+=_|]+$").expect("Invalid separator regex"));
static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s+").expect("Invalid row regex"));
static MENU: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[\[\(][A-Za-z]").expect("Invalid menu regex"));
static ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\berror\b|\bfail(ed|ure)?\b").expect("Invalid error regex"));

/// Classifies one region by its content and row.
pub fn classify(row: usize, content: &str) -> ElementType {
    if SEPARATOR.is_match(content) {
        ElementType::Status
    } else if ERROR.is_match(content) {
        ElementType::Error
    } else if row == 0 {
        ElementType::Header
    } else if NUMBERED.is_match(content) {
        ElementType::Row
    } else if MENU.is_match(content) {
        ElementType::Menu
    } else {
        ElementType::Text
    }
}

/// Finds `(start_col, text)` regions on one line.
///
/// Columns count characters, matching grid cells.
pub fn regions(line: &str) -> Vec<(usize, String)> {
    let chars: Vec<char> = line.chars().collect();
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    let mut blanks = 0;

    for (i, c) in chars.iter().enumerate() {
        if *c == ' ' {
            blanks += 1;
            if let Some(s) = start {
                if blanks >= REGION_GAP {
                    let end = i + 1 - blanks;
                    out.push((s, chars[s..end].iter().collect()));
                    start = None;
                }
            }
        } else {
            if start.is_none() {
                start = Some(i);
            }
            blanks = 0;
        }
    }
    if let Some(s) = start {
        let end = chars.len() - blanks;
        out.push((s, chars[s..end].iter().collect()));
    }
    out
}

/// Segments every line into elements, in row then column order.
pub fn segment(lines: &[String]) -> Vec<ScreenElement> {
    let mut elements = Vec::new();
    for (row, line) in lines.iter().enumerate() {
        for (col, content) in regions(line) {
            let cols = content.chars().count();
            elements.push(ScreenElement {
                element_type: classify(row, &content),
                content,
                position: Position { row, col },
                size: Size { rows: 1, cols },
            });
        }
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_split_on_wide_gaps() {
        let r = regions("  left side      right");
        assert_eq!(r, vec![(2, "left side".to_string()), (17, "right".to_string())]);
    }

    #[test]
    fn test_regions_keep_narrow_gaps() {
        let r = regions("1234 root  20   0");
        assert_eq!(r, vec![(0, "1234 root  20   0".to_string())]);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0, "top - 10:00:00 up 1 day"), ElementType::Header);
        assert_eq!(classify(3, "-----+-----"), ElementType::Status);
        assert_eq!(classify(3, "1234 root 20"), ElementType::Row);
        assert_eq!(classify(3, "[q] quit"), ElementType::Menu);
        assert_eq!(classify(3, "Connection failed"), ElementType::Error);
        assert_eq!(classify(3, "just words"), ElementType::Text);
    }

    #[test]
    fn test_segment_positions() {
        let lines = vec!["title".to_string(), String::new(), "   body".to_string()];
        let elements = segment(&lines);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].position, Position { row: 2, col: 3 });
        assert_eq!(elements[1].size, Size { rows: 1, cols: 4 });
    }
}
