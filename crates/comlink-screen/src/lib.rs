//! Terminal screen parser.
//!
//! Turns a raw byte stream from an interactive terminal application into a
//! [`ParsedScreen`]: a character grid rebuilt by interpreting cursor and
//! erase sequences, segmented into [`ScreenElement`]s, plus whatever the
//! selected [`Application`] extractor understands (a `top` process table,
//! `vim` mode and cursor, COM chat lines).
//!
//! Parsing never fails. Binary noise yields an empty element list and a
//! `parse_error` metadata entry; truncated frames are read as far as they go.
//!
//! # Example
//!
//! ```
//! use comlink_screen::{parse, to_plain_text, Application};
//!
//! let screen = parse(b"\x1b[2J\x1b[1;1Hhello\x1b[2;3Hworld", Application::Generic);
//! assert_eq!(to_plain_text(&screen), "hello\n  world");
//! ```

pub mod element;
pub mod error;
pub mod extract;
pub mod grid;
pub mod parser;
pub mod segment;

pub use element::{
    Application, ElementType, ParsedScreen, Position, ScreenElement, ScreenEvent, Size,
};
pub use error::ScreenError;
pub use extract::com::{count_echoes, find_echo, Echo};
pub use extract::generic::extract_menu_items;
pub use parser::{extract_table, parse, to_plain_text, ScreenParser};
