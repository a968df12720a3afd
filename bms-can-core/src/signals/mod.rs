//! Signal table and DBC parser
//!
//! This module contains the static signal definitions the decoder works from
//! and the loaders that build them from TOML tables or DBC files.

pub mod dbc;
pub mod table;

// Re-export key types for convenience
pub use table::{ByteOrder, SignalDefinition, SignalTable, TableStats};
