//! Consumer side of one `run` invocation

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::OUTPUT_CHANNEL_CAPACITY;

/// One output line, newline stripped
pub type Line = Vec<u8>;

/// The two line channels of one submitted command.
///
/// Each channel closes on its own once its end marker has been read, so
/// stdout may finish before or after stderr. Dropping this value is fine:
/// the readers keep consuming up to the marker in the background.
pub struct CommandOutput {
    stdout: mpsc::Receiver<Line>,
    stderr: mpsc::Receiver<Line>,
}

impl CommandOutput {
    pub(crate) fn new(stdout: mpsc::Receiver<Line>, stderr: mpsc::Receiver<Line>) -> Self {
        Self { stdout, stderr }
    }

    pub fn stdout(&mut self) -> &mut mpsc::Receiver<Line> {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut mpsc::Receiver<Line> {
        &mut self.stderr
    }

    /// Split into `(stdout, stderr)` receivers.
    pub fn into_channels(self) -> (mpsc::Receiver<Line>, mpsc::Receiver<Line>) {
        (self.stdout, self.stderr)
    }

    /// Merge both streams into one channel that closes after both sources do.
    ///
    /// Lines keep their per-stream order; interleaving between the two
    /// streams is arbitrary.
    pub fn combined(self) -> mpsc::Receiver<Line> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        for mut source in [self.stdout, self.stderr] {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(line) = source.recv().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        rx
    }

    /// Drain both streams into memory.
    pub async fn collect(self) -> Output {
        let (mut stdout, mut stderr) = (self.stdout, self.stderr);
        let (stdout, stderr) = tokio::join!(drain(&mut stdout), drain(&mut stderr));
        Output { stdout, stderr }
    }

    /// Drain both streams into the log: stdout at info, stderr at warn.
    pub async fn tail_log(self) {
        let (mut stdout, mut stderr) = (self.stdout, self.stderr);
        tokio::join!(
            async {
                while let Some(line) = stdout.recv().await {
                    info!("{}", String::from_utf8_lossy(&line));
                }
            },
            async {
                while let Some(line) = stderr.recv().await {
                    warn!("{}", String::from_utf8_lossy(&line));
                }
            },
        );
    }
}

async fn drain(rx: &mut mpsc::Receiver<Line>) -> Vec<Line> {
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    lines
}

/// Fully drained output of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<Line>,
    pub stderr: Vec<Line>,
}

impl Output {
    /// stdout lines joined with `\n` (lossy UTF-8)
    pub fn stdout_text(&self) -> String {
        join_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        join_lossy(&self.stderr)
    }
}

fn join_lossy(lines: &[Line]) -> String {
    lines
        .iter()
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .collect::<Vec<_>>()
        .join("\n")
}
