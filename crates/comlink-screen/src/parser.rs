//! Parse entry points and derived views.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::element::{
    Application, ElementType, ParsedScreen, Position, ScreenElement, Size, PARSE_ERROR,
};
use crate::extract;
use crate::grid::Grid;
use crate::segment::segment;

/// Default screen width.
pub const DEFAULT_WIDTH: usize = 80;
/// Default screen height.
pub const DEFAULT_HEIGHT: usize = 24;

/// Percentage of noise bytes above which input is treated as binary.
const NOISE_PERCENT: usize = 30;
/// Inputs shorter than this are never treated as binary.
const NOISE_MIN_LEN: usize = 16;

/// Screen parser with a fixed grid size.
#[derive(Debug, Clone, Copy)]
pub struct ScreenParser {
    width: usize,
    height: usize,
}

impl Default for ScreenParser {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl ScreenParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the grid size.
    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    /// Parses one frame captured now.
    pub fn parse(&self, raw: &[u8], application: Application) -> ParsedScreen {
        self.parse_at(raw, application, Utc::now())
    }

    /// Parses one frame captured at `captured_at`.
    pub fn parse_at(
        &self,
        raw: &[u8],
        application: Application,
        captured_at: DateTime<Utc>,
    ) -> ParsedScreen {
        let mut screen = ParsedScreen {
            raw_data: String::from_utf8_lossy(raw).into_owned(),
            application,
            elements: Vec::new(),
            width: self.width,
            height: self.height,
            cursor: Position { row: 0, col: 0 },
            captured_at,
            metadata: HashMap::new(),
            events: Vec::new(),
            lines: Vec::new(),
        };

        if let Some(reason) = noise(raw) {
            screen
                .metadata
                .insert(PARSE_ERROR.to_string(), Value::String(reason));
            return screen;
        }

        let mut grid = Grid::new(self.width, self.height);
        grid.feed(raw);
        let (row, col) = grid.cursor();
        let lines = grid.lines();

        let mut elements = segment(&lines);
        let extraction = extract::run(application, &lines, Position { row, col });
        // A reclassified row becomes one element covering the whole line.
        for &(retype_row, element_type) in &extraction.retype {
            let Some(line) = lines.get(retype_row) else {
                continue;
            };
            let Some(col) = line.chars().position(|c| c != ' ') else {
                continue;
            };
            let content: String = line.chars().skip(col).collect();
            let merged = ScreenElement {
                element_type,
                size: Size {
                    rows: 1,
                    cols: content.chars().count(),
                },
                content,
                position: Position { row: retype_row, col },
            };
            match elements.iter().position(|e| e.position.row == retype_row) {
                Some(at) => {
                    elements.retain(|e| e.position.row != retype_row);
                    elements.insert(at, merged);
                }
                None => elements.push(merged),
            }
        }
        elements.extend(extraction.extra);
        elements.push(ScreenElement {
            element_type: ElementType::Cursor,
            content: String::new(),
            position: Position { row, col },
            size: Size { rows: 1, cols: 1 },
        });

        screen.cursor = Position { row, col };
        screen.elements = elements;
        screen.metadata = extraction.metadata;
        screen
            .metadata
            .insert("application".into(), json!(application.to_string()));
        screen.events = extraction.events;
        screen.lines = lines;
        screen
    }
}

/// Decides whether `raw` is binary noise rather than terminal output.
///
/// Counts C0 controls a terminal application would not send plus invalid
/// UTF-8 bytes. An incomplete multi-byte sequence at the very end is a split
/// frame, not noise.
fn noise(raw: &[u8]) -> Option<String> {
    if raw.len() < NOISE_MIN_LEN {
        return None;
    }

    let mut bad = raw
        .iter()
        .filter(|&&b| matches!(b, 0x00..=0x06 | 0x0e..=0x1a | 0x1c..=0x1f | 0x7f))
        .count();

    let mut rest = raw;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(_) => break,
            Err(e) => match e.error_len() {
                Some(len) => {
                    bad += len;
                    rest = &rest[e.valid_up_to() + len..];
                }
                None => break,
            },
        }
    }

    if bad * 100 > raw.len() * NOISE_PERCENT {
        Some(format!("binary noise: {} of {} bytes", bad, raw.len()))
    } else {
        None
    }
}

/// Parses one frame with the default 80x24 grid.
pub fn parse(raw: &[u8], application: Application) -> ParsedScreen {
    ScreenParser::default().parse(raw, application)
}

/// Table rows of an already parsed screen, as column-name to value maps.
///
/// Uses the extractor's table when there is one. Otherwise `Row` elements
/// are split on whitespace and keyed by the nearest `TableHeader` above
/// them, or by column index when there is none.
pub fn extract_table(screen: &ParsedScreen) -> Vec<HashMap<String, String>> {
    if let Some(rows) = screen
        .metadata
        .get("table")
        .and_then(|t| t.get("rows"))
        .and_then(Value::as_array)
    {
        return rows
            .iter()
            .filter_map(Value::as_object)
            .map(|row| {
                row.iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                    .collect()
            })
            .collect();
    }

    let mut header: Option<Vec<String>> = None;
    let mut out = Vec::new();
    for element in &screen.elements {
        match element.element_type {
            ElementType::TableHeader => {
                header = Some(element.content.split_whitespace().map(String::from).collect());
            }
            ElementType::Row => {
                let fields = element.content.split_whitespace();
                let row: HashMap<String, String> = match &header {
                    Some(names) => names.iter().cloned().zip(fields.map(String::from)).collect(),
                    None => fields
                        .enumerate()
                        .map(|(i, f)| (i.to_string(), f.to_string()))
                        .collect(),
                };
                out.push(row);
            }
            _ => {}
        }
    }
    out
}

/// Visible text of an already parsed screen, trailing blank rows dropped.
pub fn to_plain_text(screen: &ParsedScreen) -> String {
    let end = screen
        .lines
        .iter()
        .rposition(|l| !l.is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    screen.lines[..end].join("\n")
}
