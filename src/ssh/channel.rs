//! russh session channel adapted to the three-stream process interface
//!
//! ```text
//!  stdin (duplex) ──▸ ┌──────────┐ ──data/eof──▸
//!                     │ IO pump  │                russh channel
//!  stdout ◂── mpsc ── │  task    │ ◂──Data──────
//!  stderr ◂── mpsc ── └──────────┘ ◂──ExtendedData(1)
//! ```
//!
//! A single task owns the channel, like the agent transport's IO loop. The
//! output queues are bounded; a reader that stops reading eventually stalls
//! the pump and, through the SSH window, the remote process. A shutdown
//! request still gets through while the pump waits on a full queue.
//!
//! How the output ended is recorded in a [`CloseReason`] shared with both
//! readers. Once a reader has drained its queue it reports a
//! `ConnectionAborted` error if the channel went away before EOF, so a
//! full queue can never swallow the failure.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use russh::client::Msg;
use russh::{Channel, ChannelId, ChannelMsg};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{BoxedReader, ProcessChannel, ProcessStreams};

/// Buffer between the caller's stdin writes and the pump
const STDIN_PIPE_CAPACITY: usize = 64 * 1024;

/// Chunks queued per output stream before the pump waits for the reader
const CHUNK_QUEUE: usize = 256;

/// How long `close` waits for the pump before aborting it
const PUMP_SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// How long `start` waits for the server to accept the exec request
const EXEC_REPLY_WAIT: Duration = Duration::from_secs(30);

const CLOSED_EARLY: &str = "channel closed before end of stream";

type ChunkSender = mpsc::Sender<Bytes>;
type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// `None` once EOF arrived, `Some(reason)` if the channel went away first.
/// The first writer wins.
type CloseReason = Arc<OnceLock<Option<String>>>;

struct PumpEnds {
    stdin: DuplexStream,
    outputs: Outputs,
}

struct Outputs {
    stdout: Option<ChunkSender>,
    stderr: Option<ChunkSender>,
    reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// What the channel sent while `start` waited for the exec reply
#[derive(Debug)]
enum ExecReply {
    Accepted,
    /// Arrived ahead of the reply; replayed once the pump runs
    Early(ChannelMsg),
}

pub(crate) struct SshProcessChannel {
    channel: Option<Channel<Msg>>,
    ends: Option<PumpEnds>,
    reason: Option<CloseReason>,
    pump: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl SshProcessChannel {
    pub(crate) fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel: Some(channel),
            ends: None,
            reason: None,
            pump: None,
            shutdown_tx: None,
        }
    }
}

fn chunk_reader(rx: mpsc::Receiver<Bytes>, reason: CloseReason) -> BoxedReader {
    let chunks: ChunkStream = Box::pin(stream::unfold(Some(rx), move |state| {
        let reason = reason.clone();
        async move {
            let mut rx = state?;
            match rx.recv().await {
                Some(chunk) => Some((Ok(chunk), Some(rx))),
                None => match reason.get() {
                    Some(Some(why)) => Some((
                        Err(io::Error::new(io::ErrorKind::ConnectionAborted, why.clone())),
                        None,
                    )),
                    _ => None,
                },
            }
        }
    }));
    Box::new(StreamReader::new(chunks))
}

fn exec_reply(msg: Option<ChannelMsg>, command_line: &str) -> Result<ExecReply> {
    match msg {
        Some(ChannelMsg::Success) => Ok(ExecReply::Accepted),
        Some(ChannelMsg::Failure) => Err(Error::Start(format!(
            "exec '{}': rejected by server",
            command_line
        ))),
        Some(ChannelMsg::Close) | None => Err(Error::Start(format!(
            "exec '{}': channel closed before reply",
            command_line
        ))),
        Some(other) => Ok(ExecReply::Early(other)),
    }
}

#[async_trait]
impl ProcessChannel for SshProcessChannel {
    fn take_streams(&mut self) -> Result<ProcessStreams> {
        if self.ends.is_some() || self.pump.is_some() {
            return Err(Error::Stream("streams already taken".into()));
        }
        let (stdin_local, stdin_pump) = duplex(STDIN_PIPE_CAPACITY);
        let (stdout_tx, stdout_rx) = mpsc::channel(CHUNK_QUEUE);
        let (stderr_tx, stderr_rx) = mpsc::channel(CHUNK_QUEUE);
        let reason = CloseReason::default();

        self.ends = Some(PumpEnds {
            stdin: stdin_pump,
            outputs: Outputs {
                stdout: Some(stdout_tx),
                stderr: Some(stderr_tx),
                reason: reason.clone(),
            },
        });
        self.reason = Some(reason.clone());
        Ok(ProcessStreams {
            stdin: Box::new(stdin_local),
            stdout: chunk_reader(stdout_rx, reason.clone()),
            stderr: chunk_reader(stderr_rx, reason),
        })
    }

    async fn start(&mut self, command_line: &str) -> Result<()> {
        let ends = self
            .ends
            .take()
            .ok_or_else(|| Error::Start("streams must be taken before start".into()))?;
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| Error::Start("channel already started".into()))?;

        channel
            .exec(true, command_line)
            .await
            .map_err(|e| Error::Start(format!("exec '{}': {}", command_line, e)))?;

        let mut early = Vec::new();
        loop {
            let reply = match tokio::time::timeout(EXEC_REPLY_WAIT, channel.wait()).await {
                Ok(msg) => exec_reply(msg, command_line),
                Err(_) => Err(Error::Start(format!(
                    "exec '{}': no reply within {:?}",
                    command_line, EXEC_REPLY_WAIT
                ))),
            };
            match reply {
                Ok(ExecReply::Accepted) => break,
                Ok(ExecReply::Early(msg)) => early.push(msg),
                Err(e) => {
                    warn!("[process] channel {:?}: {}", channel.id(), e);
                    let _ = channel.close().await;
                    return Err(e);
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.pump = Some(tokio::spawn(pump(channel, ends, early, shutdown_rx)));
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }
        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout(PUMP_SHUTDOWN_WAIT, &mut pump).await.is_err() {
                warn!("[process] channel pump did not stop, aborting");
                if let Some(reason) = &self.reason {
                    let _ = reason.set(Some(CLOSED_EARLY.to_string()));
                }
                pump.abort();
            }
        }
        // never started
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
        if let Some(reason) = self.reason.take() {
            let _ = reason.set(Some(CLOSED_EARLY.to_string()));
        }
        self.ends = None;
    }
}

async fn pump(
    mut channel: Channel<Msg>,
    ends: PumpEnds,
    early: Vec<ChannelMsg>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let PumpEnds {
        mut stdin,
        mut outputs,
    } = ends;
    let id = channel.id();
    let mut stdin_open = true;
    let mut buf = vec![0u8; 32 * 1024];

    let mut flow = Flow::Continue;
    for msg in early {
        flow = outputs.deliver(Some(msg), id, &mut shutdown_rx).await;
        if flow == Flow::Stop {
            break;
        }
    }

    while flow == Flow::Continue {
        flow = tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!("[process] channel {:?} shutdown requested", id);
                Flow::Stop
            }
            msg = channel.wait() => outputs.deliver(msg, id, &mut shutdown_rx).await,
            n = stdin.read(&mut buf), if stdin_open => {
                match n {
                    Ok(0) | Err(_) => {
                        stdin_open = false;
                        if channel.eof().await.is_err() {
                            debug!("[process] eof on closed channel {:?}", id);
                        }
                    }
                    Ok(n) => {
                        if let Err(e) = channel.data(&buf[..n]).await {
                            warn!("[process] write to channel {:?} failed: {}", id, e);
                            stdin_open = false;
                        }
                    }
                }
                Flow::Continue
            }
        };
    }

    // no-op when EOF was already recorded
    let _ = outputs.reason.set(Some(CLOSED_EARLY.to_string()));
    drop(outputs);

    let _ = channel.close().await;
    debug!("[process] channel {:?} pump ended", id);
}

impl Outputs {
    async fn deliver(
        &mut self,
        msg: Option<ChannelMsg>,
        id: ChannelId,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> Flow {
        match msg {
            Some(ChannelMsg::Data { data }) => {
                forward_until_shutdown(&mut self.stdout, Bytes::copy_from_slice(&data), shutdown_rx)
                    .await
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                forward_until_shutdown(&mut self.stderr, Bytes::copy_from_slice(&data), shutdown_rx)
                    .await
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                debug!("[process] channel {:?} exited with status {}", id, exit_status);
                Flow::Continue
            }
            Some(ChannelMsg::Eof) => {
                let _ = self.reason.set(None);
                // readers see end of stream once their sender is gone
                self.stdout = None;
                self.stderr = None;
                Flow::Continue
            }
            Some(ChannelMsg::Close) | None => Flow::Stop,
            Some(_) => Flow::Continue,
        }
    }
}

/// Queue `chunk` for the reader, giving up if shutdown is requested while
/// the queue is full.
async fn forward_until_shutdown(
    sender: &mut Option<ChunkSender>,
    chunk: Bytes,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> Flow {
    let Some(tx) = sender else {
        return Flow::Continue;
    };
    let delivered = tokio::select! {
        biased;

        _ = shutdown_rx.recv() => return Flow::Stop,
        sent = tx.send(chunk) => sent.is_ok(),
    };
    if !delivered {
        // reader dropped; keep consuming so the other stream is not starved
        *sender = None;
    }
    Flow::Continue
}
