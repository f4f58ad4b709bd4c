//! Persistent remote shell execution and recursive SCP upload over one SSH
//! connection.
//!
//! ```text
//! ┌──────────────────────── Session ────────────────────────┐
//! │  run ──▸ exec::Shell ──▸ one long-lived `/bin/bash`     │
//! │  copy_to ──▸ scp::copy_to ──▸ `scp -tr <dir>` per level │
//! └──────────────┬──────────────────────────────────────────┘
//!                ▾
//!        process::Connection  (ssh::SshConnection, russh)
//! ```

pub mod config;
pub mod error;
pub mod exec;
pub mod process;
pub mod scp;
pub mod session;
pub mod ssh;

#[cfg(test)]
mod testing;

use std::sync::Once;

pub use config::{AuthMethod, ConnectConfig, RetryConfig};
pub use error::{Error, Result};
pub use exec::{CommandOutput, Line, Output};
pub use session::Session;
pub use ssh::SshConnection;

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call has an effect, and an
/// already installed global subscriber is left alone.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
