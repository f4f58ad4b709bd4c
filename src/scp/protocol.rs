//! SCP sink wire protocol
//!
//! ```text
//! source                           sink (scp -t)
//!   │                                 │
//!   │ ◂──────────── \0 ────────────── │  ready
//!   │ ── D0755 0 <dir>\n ───────────▸ │
//!   │ ◂──────────── ack ───────────── │
//!   │ ── C0644 <size> <file>\n ─────▸ │
//!   │ ◂──────────── ack ───────────── │
//!   │ ── <size bytes> \0 ───────────▸ │
//!   │ ◂──────────── ack ───────────── │
//!   │ ── E\n ───────────────────────▸ │
//!   │ ◂──────────── ack ───────────── │
//! ```
//!
//! An ack is one byte: 0 ok, 1 warning + message line, 2 fatal + message line.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

pub const ACK_OK: u8 = 0;
pub const ACK_WARNING: u8 = 1;
pub const ACK_FATAL: u8 = 2;

/// Mode sent for every directory
pub const DIR_MODE: u32 = 0o755;

/// End-of-directory control line
pub const END_DIR: &str = "E\n";

/// How long to wait for a second message line after a fatal ack
const FATAL_TRAILER_WAIT: Duration = Duration::from_millis(200);

/// Decoded sink response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpAck {
    Ok,
    Warning(String),
    Fatal(String),
}

/// `D0755 0 <name>\n`
pub fn dir_header(name: &str) -> Result<String> {
    check_name(name)?;
    Ok(format!("D{:04o} 0 {}\n", DIR_MODE, name))
}

/// `C<mode> <size> <name>\n`, mode as four octal digits (`0644` → `C0644`).
pub fn file_header(mode: u32, size: u64, name: &str) -> Result<String> {
    check_name(name)?;
    Ok(format!("C{:04o} {} {}\n", mode & 0o7777, size, name))
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\n']) {
        return Err(Error::InvalidPath(format!(
            "'{}' cannot be sent as an scp entry name",
            name.escape_default()
        )));
    }
    Ok(())
}

/// Read one ack from the sink.
pub async fn read_ack<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ScpAck> {
    let mut code = [0u8; 1];
    reader.read_exact(&mut code).await.map_err(Error::Read)?;

    match code[0] {
        ACK_OK => Ok(ScpAck::Ok),
        ACK_WARNING => Ok(ScpAck::Warning(read_message(reader).await?)),
        ACK_FATAL => {
            let message = read_message(reader).await?;
            // some sinks follow up with a second line before exiting
            let trailer = tokio::time::timeout(FATAL_TRAILER_WAIT, read_message(reader))
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default();
            if trailer.is_empty() {
                Ok(ScpAck::Fatal(message))
            } else {
                Ok(ScpAck::Fatal(format!("{} {}", message, trailer)))
            }
        }
        other => Err(Error::Protocol(format!(
            "unexpected scp response byte {:#04x}",
            other
        ))),
    }
}

async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(Error::Read)?;
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}
