//! Trace-log line format
//!
//! Records render through `Display` as a single line without the trailing
//! newline and parse back through `FromStr`. Identifiers handed out by the
//! runtime are written as 16 hex digits, internal ids and statuses as 8.

mod format;
mod parse;

pub use format::quote;

use thiserror::Error;

/// Errors produced while parsing a trace-log line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("empty record")]
    Empty,

    #[error("unknown record tag: {0} {1}")]
    UnknownTag(String, String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("unterminated quoted string")]
    UnterminatedString,

    #[error("unexpected trailing data: {0}")]
    TrailingData(String),
}
