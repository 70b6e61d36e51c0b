//! Raw lines, plus menu items when the screen shows any.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

use super::Extraction;
use crate::element::{ElementType, ParsedScreen};

static MENU_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z0-9])\]\s*([\w-]+)").expect("Invalid menu regex"));

pub(crate) fn extract(lines: &[String]) -> Extraction {
    let mut extraction = Extraction::default();
    let non_blank: Vec<Value> = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| Value::String(l.clone()))
        .collect();
    extraction
        .metadata
        .insert("line_count".into(), json!(non_blank.len()));
    extraction.metadata.insert("lines".into(), Value::Array(non_blank));
    extraction
}

/// `(key, label)` pairs from `[k] label` style menus on an already parsed
/// screen.
pub fn extract_menu_items(screen: &ParsedScreen) -> Vec<(String, String)> {
    screen
        .elements_of(ElementType::Menu)
        .flat_map(|e| MENU_ITEM.captures_iter(&e.content))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}
