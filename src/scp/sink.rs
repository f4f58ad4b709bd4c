//! One remote `scp -tr <dir>` process and the guard that cleans it up

use std::borrow::Cow;
use std::fs::Metadata;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

use super::protocol::{self, ScpAck};
use crate::error::{Error, Result};
use crate::process::{BoxedReader, BoxedWriter, Connection, RemoteProcess};

/// A started sink rooted at one remote directory.
pub struct ScpSink {
    target: String,
    process: RemoteProcess,
    reader: BufReader<BoxedReader>,
    writer: BufWriter<BoxedWriter>,
}

impl ScpSink {
    /// Start `scp -tr <target>` and wait for its ready byte.
    pub async fn open(connection: &dyn Connection, target: &str) -> Result<Self> {
        let command = format!("scp -tr {}", shell_quote(target));
        let mut process = RemoteProcess::open(connection, &command).await?;

        let (stdin, stdout) = match (process.take_stdin(), process.take_stdout()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                process.close().await;
                return Err(Error::Stream(format!("'{}' has no stdio", command)));
            }
        };
        if let Some(stderr) = process.take_stderr() {
            tokio::spawn(log_stderr(target.to_string(), stderr));
        }

        let mut sink = Self {
            target: target.to_string(),
            process,
            reader: BufReader::new(stdout),
            writer: BufWriter::new(stdin),
        };

        if let Err(e) = sink.expect_ack().await {
            sink.close().await;
            return Err(e);
        }
        debug!("[scp] sink ready at {}", sink.target);
        Ok(sink)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// `D` line: enter (creating if needed) directory `name`.
    pub async fn push_dir(&mut self, name: &str) -> Result<()> {
        let header = protocol::dir_header(name)?;
        self.send_control(&header).await
    }

    /// `E` line: leave the current directory.
    pub async fn end_dir(&mut self) -> Result<()> {
        self.send_control(protocol::END_DIR).await
    }

    /// `C` line, file body, terminating NUL.
    pub async fn push_file(&mut self, path: &Path) -> Result<()> {
        let metadata = tokio::fs::metadata(path).await?;
        let name = entry_name(path)?;
        let size = metadata.len();
        let header = protocol::file_header(file_mode(&metadata), size, &name)?;
        self.send_control(&header).await?;

        let file = tokio::fs::File::open(path).await?;
        let copied = tokio::io::copy(&mut file.take(size), &mut self.writer)
            .await
            .map_err(Error::Write)?;
        if copied != size {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} shrank during upload ({} of {} bytes)",
                    path.display(),
                    copied,
                    size
                ),
            )));
        }

        self.writer.write_all(&[0]).await.map_err(Error::Write)?;
        self.writer.flush().await.map_err(Error::Write)?;
        self.expect_ack().await?;

        debug!("[scp] {} -> {}/{} ({} bytes)", path.display(), self.target, name, size);
        Ok(())
    }

    /// Close stdin, then the process.
    pub async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("[scp] stdin shutdown for {}: {}", self.target, e);
        }
        self.process.close().await;
    }

    async fn send_control(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(Error::Write)?;
        self.writer.flush().await.map_err(Error::Write)?;
        self.expect_ack().await
    }

    async fn expect_ack(&mut self) -> Result<()> {
        match protocol::read_ack(&mut self.reader).await? {
            ScpAck::Ok => Ok(()),
            ScpAck::Warning(message) => {
                warn!("[scp] {}: {}", self.target, message);
                Ok(())
            }
            ScpAck::Fatal(message) => Err(Error::Protocol(message)),
        }
    }
}

/// Closes the sink when dropped, unless [`SinkGuard::commit`] ran first.
///
/// Failure paths just return; the guard tears the process down in the
/// background so no channel outlives the transfer.
pub struct SinkGuard {
    sink: ScpSink,
    armed: bool,
}

impl SinkGuard {
    pub fn new(sink: ScpSink) -> Self {
        Self { sink, armed: true }
    }

    /// Success path: disarm and close in the foreground.
    pub async fn commit(mut self) {
        self.armed = false;
        self.sink.close().await;
    }
}

impl Deref for SinkGuard {
    type Target = ScpSink;

    fn deref(&self) -> &ScpSink {
        &self.sink
    }
}

impl DerefMut for SinkGuard {
    fn deref_mut(&mut self) -> &mut ScpSink {
        &mut self.sink
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("[scp] transfer into {} failed, closing sink", self.sink.target);
        let mut process = std::mem::take(&mut self.sink.process);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    process.close().await;
                });
            }
            Err(_) => debug!("[scp] no runtime, sink for {} dropped", self.sink.target),
        }
    }
}

async fn log_stderr(target: String, stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[scp-stderr] {}: {}", target, line);
    }
}

/// Final path component as sent in a control line
pub(crate) fn entry_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidPath(format!("{} has no file name", path.display())))
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Single-quote `arg` for the remote shell unless it is plainly safe.
pub(crate) fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-+:,@%~=".contains(&b));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
    }
}
