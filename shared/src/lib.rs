//! Shared types and utilities for rtprof
//!
//! This crate contains the trace-log record model written by the agent and
//! read back by the command-line tools, the stack replayer that turns
//! diff-encoded stack samples into full stacks, and small helpers used on
//! both sides.

pub mod protocol;
pub mod replay;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use protocol::RecordError;
pub use replay::{ReplayError, StackReplay};
pub use types::{ids::*, profile::*, records::*};
