//! Line readers that forward shell output until the end marker

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::marker::is_marker_line;

/// Buffer segment size; longer lines arrive in several segments.
pub const SEGMENT_SIZE: usize = 1024;

/// A piece of a line as returned by [`LineReader::read_segment`]
#[derive(Debug, PartialEq, Eq)]
pub enum Segment {
    /// More bytes of a line that is still being assembled
    Partial(Vec<u8>),
    /// The final bytes of a line, newline stripped
    End(Vec<u8>),
}

/// Buffered reader handing out line segments of at most [`SEGMENT_SIZE`] bytes.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(SEGMENT_SIZE, inner),
        }
    }

    /// Next segment, or `None` at end of stream.
    pub async fn read_segment(&mut self) -> io::Result<Option<Segment>> {
        let available = self.inner.fill_buf().await?;
        if available.is_empty() {
            return Ok(None);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let segment = available[..pos].to_vec();
                self.inner.consume(pos + 1);
                Ok(Some(Segment::End(segment)))
            }
            None => {
                let segment = available.to_vec();
                self.inner.consume(segment.len());
                Ok(Some(Segment::Partial(segment)))
            }
        }
    }
}

/// Why a forwarding loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The marker line was seen; the stream is positioned after it.
    Marker,
    /// End of stream before the marker
    Eof,
    /// Read error; an `error reading pipe` line was emitted
    Failed,
}

/// Forward complete lines from `reader` to `tx` until the marker line.
///
/// Sends block while `tx` is full. If the receiver goes away the loop keeps
/// reading (and discarding) up to the marker so the stream stays aligned for
/// the next command.
pub async fn forward_lines<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    marker: &str,
    tx: &mpsc::Sender<Vec<u8>>,
) -> StreamEnd {
    let mut line: Vec<u8> = Vec::new();
    let mut detached = false;

    loop {
        let segment = match reader.read_segment().await {
            Ok(Some(segment)) => segment,
            Ok(None) => {
                // unterminated last line
                if !line.is_empty() {
                    if is_marker_line(&line, marker) {
                        return StreamEnd::Marker;
                    }
                    deliver(tx, &mut detached, line).await;
                }
                return StreamEnd::Eof;
            }
            Err(e) => {
                if !line.is_empty() {
                    deliver(tx, &mut detached, std::mem::take(&mut line)).await;
                }
                let notice = format!("error reading pipe: {}", e);
                deliver(tx, &mut detached, notice.into_bytes()).await;
                return StreamEnd::Failed;
            }
        };

        match segment {
            Segment::Partial(bytes) => line.extend_from_slice(&bytes),
            Segment::End(bytes) => {
                line.extend_from_slice(&bytes);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if is_marker_line(&line, marker) {
                    trace!("end marker reached");
                    return StreamEnd::Marker;
                }
                deliver(tx, &mut detached, std::mem::take(&mut line)).await;
            }
        }
    }
}

async fn deliver(tx: &mpsc::Sender<Vec<u8>>, detached: &mut bool, line: Vec<u8>) {
    if *detached {
        return;
    }
    if tx.send(line).await.is_err() {
        debug!("output receiver dropped, discarding until end marker");
        *detached = true;
    }
}
