//! Persistent remote shell driven by end markers
//!
//! Every command is written to the shell's stdin followed by two marker
//! echoes, one per output stream:
//!
//! ```text
//! <command>
//! echo '$$__<nanos>_<salt>__$$'
//! echo '$$__<nanos>_<salt>__$$' >&2
//! ```
//!
//! One reader task per stream forwards lines until it sees its marker line.
//! The shell process itself never exits between commands, so working
//! directory and variables carry over.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::marker;
use super::output::CommandOutput;
use super::reader::{forward_lines, LineReader, StreamEnd};
use super::OUTPUT_CHANNEL_CAPACITY;
use crate::error::{Error, Result};
use crate::process::{BoxedReader, BoxedWriter, Connection, RemoteProcess};

type SharedReader = Arc<Mutex<LineReader<BoxedReader>>>;

/// A long-lived shell process plus its two line readers.
pub struct Shell {
    process: RemoteProcess,
    stdout: SharedReader,
    stderr: SharedReader,
    alive: Arc<AtomicBool>,
}

impl Shell {
    /// Start `command_line` (normally `/bin/bash`) on a new channel.
    pub async fn spawn(connection: &dyn Connection, command_line: &str) -> Result<Self> {
        let mut process = RemoteProcess::open(connection, command_line).await?;

        let (stdout, stderr) = match (process.take_stdout(), process.take_stderr()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                process.close().await;
                return Err(Error::Stream("shell output streams unavailable".into()));
            }
        };

        info!("[shell] started '{}'", command_line);

        Ok(Self {
            process,
            stdout: Arc::new(Mutex::new(LineReader::new(stdout))),
            stderr: Arc::new(Mutex::new(LineReader::new(stderr))),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    /// False once a reader hit end-of-stream or a write failed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && self.process.is_open()
    }

    /// Submit `command` and return its output channels.
    ///
    /// Waits until the previous command's readers have reached their markers,
    /// which requires its output to be drained or dropped. Calling `run` again
    /// while holding an undrained [`CommandOutput`] from the same shell
    /// therefore blocks once that output fills its channels.
    pub async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let stdout = self.stdout.clone().lock_owned().await;
        let stderr = self.stderr.clone().lock_owned().await;
        if !self.is_alive() {
            return Err(Error::ShellExited);
        }

        let marker = marker::generate();
        let script = [
            format!("{}\n", command),
            format!("echo '{}'\n", marker),
            format!("echo '{}' >&2\n", marker),
        ];

        let stdin = self.process.stdin_mut().ok_or(Error::ShellExited)?;
        for line in &script {
            if let Err(e) = write_line(stdin, line).await {
                warn!("[shell] write to stdin failed: {}", e);
                self.alive.store(false, Ordering::Release);
                return Err(Error::Write(e));
            }
        }
        debug!("[shell] submitted command, marker {}", marker);

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        tokio::spawn(pump_stream(
            "stdout",
            stdout,
            marker.clone(),
            out_tx,
            self.alive.clone(),
        ));
        tokio::spawn(pump_stream(
            "stderr",
            stderr,
            marker,
            err_tx,
            self.alive.clone(),
        ));

        Ok(CommandOutput::new(out_rx, err_rx))
    }

    /// Close stdin and the channel.
    pub async fn close(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.process.close().await;
        info!("[shell] closed");
    }
}

async fn write_line(stdin: &mut BoxedWriter, line: &str) -> io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn pump_stream(
    stream: &'static str,
    mut reader: OwnedMutexGuard<LineReader<BoxedReader>>,
    marker: String,
    tx: mpsc::Sender<Vec<u8>>,
    alive: Arc<AtomicBool>,
) {
    match forward_lines(&mut *reader, &marker, &tx).await {
        StreamEnd::Marker => {}
        StreamEnd::Eof => {
            warn!("[shell] {} ended before end marker, shell exited", stream);
            alive.store(false, Ordering::Release);
        }
        StreamEnd::Failed => {
            warn!("[shell] {} read failed, shell unusable", stream);
            alive.store(false, Ordering::Release);
        }
    }
}
