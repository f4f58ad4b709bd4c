//! End-of-command sentinel markers

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

const MARKER_PREFIX: &str = "$$__";
const MARKER_SUFFIX: &str = "__$$";

/// Generate a fresh sentinel of the form `$$__<nanos>_<hex>__$$`.
///
/// A command that prints this exact line cuts its own output short.
pub fn generate() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let salt: u64 = rand::thread_rng().gen();
    format!("{}{}_{:016x}{}", MARKER_PREFIX, nanos, salt, MARKER_SUFFIX)
}

/// Exact length + content comparison; substrings never match.
pub fn is_marker_line(line: &[u8], marker: &str) -> bool {
    line.len() == marker.len() && line == marker.as_bytes()
}
