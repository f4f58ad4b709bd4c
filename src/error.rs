//! Error types shared by the shell multiplexer, SCP client and SSH transport

use thiserror::Error;

/// Errors surfaced by [`crate::Session`] and the layers beneath it.
///
/// Read failures that happen after `run` has returned are not reported here;
/// they arrive in-band as an `error reading pipe: ...` output line.
#[derive(Debug, Error)]
pub enum Error {
    /// Dialing or the SSH handshake failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The server rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The private key file could not be read or parsed.
    #[error("Key error: {0}")]
    Key(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// The connection refused to allocate another channel.
    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    #[error("Stream unavailable: {0}")]
    Stream(String),

    /// The remote command could not be started on an open channel.
    #[error("Failed to start remote process: {0}")]
    Start(String),

    #[error("Write error: {0}")]
    Write(#[source] std::io::Error),

    #[error("Read error: {0}")]
    Read(#[source] std::io::Error),

    /// Fatal SCP acknowledgement; carries the remote message text.
    #[error("{0}")]
    Protocol(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Remote shell exited")]
    ShellExited,

    #[error("Session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same dial can never succeed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Key(_))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
