//! Remote Process Handle
//!
//! One remote command bound to one freshly opened channel, exposed as three
//! raw byte streams. Nothing here knows about commands, markers or SCP.
//!
//! The transport boundary is the pair of traits [`Connection`] and
//! [`ProcessChannel`]; `crate::ssh` implements them on top of russh.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The three byte streams of one channel.
pub struct ProcessStreams {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

/// An authenticated transport that can open many process channels.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Allocate a new session channel.
    async fn open_channel(&self) -> Result<Box<dyn ProcessChannel>>;

    /// Tear down the transport; every channel opened from it becomes invalid.
    async fn close(&self) -> Result<()>;
}

/// A single session channel before and after its command is started.
#[async_trait]
pub trait ProcessChannel: Send {
    /// Hand out the channel's byte streams. Called once, before `start`.
    fn take_streams(&mut self) -> Result<ProcessStreams>;

    /// Start `command_line` on the channel.
    async fn start(&mut self, command_line: &str) -> Result<()>;

    /// Wait for or force the channel closed. Must tolerate repeated calls.
    async fn close(&mut self);
}

/// A started remote process.
///
/// Close it with [`RemoteProcess::close`]; dropping it only drops the local
/// ends of the streams and leaves the channel to the transport.
#[derive(Default)]
pub struct RemoteProcess {
    command_line: String,
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    channel: Option<Box<dyn ProcessChannel>>,
}

impl RemoteProcess {
    /// Open a channel on `connection` and start `command_line` on it.
    ///
    /// A channel that was opened but failed later is closed before the error
    /// is returned.
    pub async fn open(connection: &dyn Connection, command_line: &str) -> Result<Self> {
        let mut channel = connection.open_channel().await.map_err(|e| match e {
            Error::ChannelOpen(_) => e,
            other => Error::ChannelOpen(other.to_string()),
        })?;

        let streams = match channel.take_streams() {
            Ok(streams) => streams,
            Err(e) => {
                channel.close().await;
                return Err(match e {
                    Error::Stream(_) => e,
                    other => Error::Stream(other.to_string()),
                });
            }
        };

        if let Err(e) = channel.start(command_line).await {
            channel.close().await;
            return Err(match e {
                Error::Start(_) => e,
                other => Error::Start(other.to_string()),
            });
        }

        debug!("[process] started '{}'", command_line);

        Ok(Self {
            command_line: command_line.to_string(),
            stdin: Some(streams.stdin),
            stdout: Some(streams.stdout),
            stderr: Some(streams.stderr),
            channel: Some(channel),
        })
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Still owns stdin and has not been closed
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn stdin_mut(&mut self) -> Option<&mut BoxedWriter> {
        self.stdin.as_mut()
    }

    pub fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    /// Close stdin (EOF to the remote side), then the channel.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                debug!("[process] stdin shutdown for '{}': {}", self.command_line, e);
            }
        }
        self.stdout = None;
        self.stderr = None;
        match self.channel.take() {
            Some(mut channel) => {
                channel.close().await;
                debug!("[process] closed '{}'", self.command_line);
            }
            None => {
                if !self.command_line.is_empty() {
                    warn!("[process] '{}' already closed", self.command_line);
                }
            }
        }
    }
}
