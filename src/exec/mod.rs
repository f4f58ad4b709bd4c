//! Command Multiplexer
//!
//! Runs commands inside one long-lived remote shell and delivers each
//! command's stdout and stderr as two independent, ordered line channels.
//!
//! # Invariants
//! - Each output channel holds at most [`OUTPUT_CHANNEL_CAPACITY`] unread lines;
//!   readers block rather than drop lines.
//! - The marker line is never delivered.
//! - stdout and stderr close independently, in no particular order.
//! - No timeout is applied: a command that never returns stalls its readers.

pub mod marker;
mod output;
pub mod reader;
mod shell;

pub use output::{CommandOutput, Line, Output};
pub use shell::Shell;

/// Bound of each per-invocation output channel
pub const OUTPUT_CHANNEL_CAPACITY: usize = 16;
