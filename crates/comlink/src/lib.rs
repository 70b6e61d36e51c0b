//! Command-line front end for the comlink gateway.
//!
//! `comlink` (or `comlink run`) starts the gateway in the foreground;
//! `init`, `check` and `status` manage its state directory.

pub mod cli;
pub mod commands;
