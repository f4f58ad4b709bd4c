//! In-memory transport used by the unit tests.
//!
//! `FakeConnection` hands out channels backed by `tokio::io::duplex` pipes.
//! Starting `scp -tr <dir>` runs an SCP sink emulator; any other command runs
//! a tiny scripted shell. Both operate on one shared fake remote filesystem.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{
    duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream,
};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::process::{Connection, ProcessChannel, ProcessStreams};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Displayed by `pwd` for the relative root.
pub(crate) const FAKE_HOME: &str = "/home/fake";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelFailure {
    Open,
    Streams,
    Start,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RemoteNode {
    Dir { mode: u32 },
    File { mode: u32, data: Vec<u8> },
}

struct Shared {
    fs: BTreeMap<String, RemoteNode>,
    opened: usize,
    closed: usize,
    commands: Vec<String>,
    transcript: Vec<String>,
    fail_next: Option<ChannelFailure>,
    fatal_names: HashSet<String>,
    warn_names: HashSet<String>,
    connection_closed: bool,
}

type SharedState = Arc<Mutex<Shared>>;

#[derive(Clone)]
pub(crate) struct FakeConnection {
    shared: SharedState,
}

impl FakeConnection {
    pub(crate) fn new() -> Self {
        let mut fs = BTreeMap::new();
        fs.insert("/".to_string(), RemoteNode::Dir { mode: 0o755 });
        fs.insert(String::new(), RemoteNode::Dir { mode: 0o755 });
        Self {
            shared: Arc::new(Mutex::new(Shared {
                fs,
                opened: 0,
                closed: 0,
                commands: Vec::new(),
                transcript: Vec::new(),
                fail_next: None,
                fatal_names: HashSet::new(),
                warn_names: HashSet::new(),
                connection_closed: false,
            })),
        }
    }

    pub(crate) fn fail_next(&self, failure: ChannelFailure) {
        self.shared.lock().unwrap().fail_next = Some(failure);
    }

    /// Sink answers any `C`/`D` header naming `name` with a fatal ack.
    pub(crate) fn fail_on(&self, name: &str) {
        self.shared.lock().unwrap().fatal_names.insert(name.to_string());
    }

    /// Sink answers the body of file `name` with a warning ack.
    pub(crate) fn warn_on(&self, name: &str) {
        self.shared.lock().unwrap().warn_names.insert(name.to_string());
    }

    /// Seed a remote directory.
    pub(crate) fn mkdir(&self, path: &str) {
        self.shared
            .lock()
            .unwrap()
            .fs
            .insert(normalize(path), RemoteNode::Dir { mode: 0o755 });
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.shared.lock().unwrap().opened
    }

    pub(crate) fn channels_closed(&self) -> usize {
        self.shared.lock().unwrap().closed
    }

    pub(crate) fn started_commands(&self) -> Vec<String> {
        self.shared.lock().unwrap().commands.clone()
    }

    /// Control lines received by every sink, in arrival order.
    pub(crate) fn transcript(&self) -> Vec<String> {
        self.shared.lock().unwrap().transcript.clone()
    }

    pub(crate) fn remote(&self, path: &str) -> Option<RemoteNode> {
        self.shared.lock().unwrap().fs.get(&normalize(path)).cloned()
    }

    pub(crate) fn remote_paths(&self) -> Vec<String> {
        self.shared
            .lock()
            .unwrap()
            .fs
            .keys()
            .filter(|p| !p.is_empty() && p.as_str() != "/")
            .cloned()
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().connection_closed
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn open_channel(&self) -> Result<Box<dyn ProcessChannel>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.connection_closed {
            return Err(Error::ChannelOpen("connection closed".into()));
        }
        let failure = shared.fail_next.take();
        if failure == Some(ChannelFailure::Open) {
            return Err(Error::ChannelOpen("administratively prohibited".into()));
        }
        shared.opened += 1;
        Ok(Box::new(FakeChannel {
            shared: self.shared.clone(),
            failure,
            remote: None,
            task: None,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shared.lock().unwrap().connection_closed = true;
        Ok(())
    }
}

struct RemoteEnds {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

struct FakeChannel {
    shared: SharedState,
    failure: Option<ChannelFailure>,
    remote: Option<RemoteEnds>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

#[async_trait]
impl ProcessChannel for FakeChannel {
    fn take_streams(&mut self) -> Result<ProcessStreams> {
        if self.failure == Some(ChannelFailure::Streams) {
            return Err(Error::Stream("pipe unavailable".into()));
        }
        let (stdin_local, stdin_remote) = duplex(PIPE_CAPACITY);
        let (stdout_local, stdout_remote) = duplex(PIPE_CAPACITY);
        let (stderr_local, stderr_remote) = duplex(PIPE_CAPACITY);
        self.remote = Some(RemoteEnds {
            stdin: stdin_remote,
            stdout: stdout_remote,
            stderr: stderr_remote,
        });
        Ok(ProcessStreams {
            stdin: Box::new(stdin_local),
            stdout: Box::new(stdout_local),
            stderr: Box::new(stderr_local),
        })
    }

    async fn start(&mut self, command_line: &str) -> Result<()> {
        if self.failure == Some(ChannelFailure::Start) {
            return Err(Error::Start("exec request rejected".into()));
        }
        let ends = self
            .remote
            .take()
            .ok_or_else(|| Error::Start("streams not taken".into()))?;
        self.shared
            .lock()
            .unwrap()
            .commands
            .push(command_line.to_string());

        let shared = self.shared.clone();
        let task = match command_line.strip_prefix("scp -tr ") {
            Some(base) => tokio::spawn(run_sink(shared, unquote(base), ends)),
            None => tokio::spawn(run_shell(shared, ends)),
        };
        self.task = Some(task);
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.lock().unwrap().closed += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if path.starts_with('/') {
        format!("/{}", parts.join("/"))
    } else {
        parts.join("/")
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        normalize(name)
    } else {
        normalize(&format!("{}/{}", dir, name))
    }
}

fn resolve(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize(path)
    } else {
        join(cwd, path)
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        s[1..s.len() - 1].replace("'\\''", "'")
    } else {
        s.to_string()
    }
}

async fn emit(w: &mut DuplexStream, bytes: &[u8]) {
    let _ = w.write_all(bytes).await;
}

async fn run_shell(shared: SharedState, ends: RemoteEnds) {
    let mut lines = BufReader::new(ends.stdin).lines();
    let mut out = ends.stdout;
    let mut err = ends.stderr;
    let mut cwd = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            break;
        }

        if line == "echo" || line.starts_with("echo ") {
            let mut rest = line.trim_start_matches("echo").trim();
            let mut to_stderr = false;
            for redirect in [" 1>&2", " >&2"] {
                if let Some(stripped) = rest.strip_suffix(redirect) {
                    rest = stripped;
                    to_stderr = true;
                    break;
                }
            }
            let text = unquote(rest.trim_matches('"'));
            let payload = format!("{}\n", text);
            if to_stderr {
                emit(&mut err, payload.as_bytes()).await;
            } else {
                emit(&mut out, payload.as_bytes()).await;
            }
        } else if let Some(dir) = line.strip_prefix("cd ") {
            let target = resolve(&cwd, dir.trim());
            let exists = matches!(
                shared.lock().unwrap().fs.get(&target),
                Some(RemoteNode::Dir { .. })
            );
            if exists {
                cwd = target;
            } else {
                let msg = format!("bash: cd: {}: No such file or directory\n", dir.trim());
                emit(&mut err, msg.as_bytes()).await;
            }
        } else if line == "pwd" {
            let shown = if cwd.starts_with('/') {
                cwd.clone()
            } else if cwd.is_empty() {
                FAKE_HOME.to_string()
            } else {
                format!("{}/{}", FAKE_HOME, cwd)
            };
            emit(&mut out, format!("{}\n", shown).as_bytes()).await;
        } else if let Some(n) = line.strip_prefix("seq ") {
            let n: u32 = n.trim().parse().unwrap_or(0);
            for i in 1..=n {
                emit(&mut out, format!("{}\n", i).as_bytes()).await;
            }
        } else if let Some(n) = line.strip_prefix("longline ") {
            let n: usize = n.trim().parse().unwrap_or(0);
            let mut payload = vec![b'y'; n];
            payload.push(b'\n');
            emit(&mut out, &payload).await;
        } else if let Some(path) = line.strip_prefix("cat ") {
            let node = shared.lock().unwrap().fs.get(&resolve(&cwd, path.trim())).cloned();
            match node {
                Some(RemoteNode::File { data, .. }) => emit(&mut out, &data).await,
                _ => {
                    let msg = format!("cat: {}: No such file or directory\n", path.trim());
                    emit(&mut err, msg.as_bytes()).await;
                }
            }
        } else if let Some(path) = line.strip_prefix("stat -c %a ") {
            let node = shared.lock().unwrap().fs.get(&resolve(&cwd, path.trim())).cloned();
            match node {
                Some(RemoteNode::File { mode, .. }) | Some(RemoteNode::Dir { mode }) => {
                    emit(&mut out, format!("{:o}\n", mode & 0o7777).as_bytes()).await;
                }
                None => {
                    let msg = format!("stat: cannot stat '{}': No such file or directory\n", path.trim());
                    emit(&mut err, msg.as_bytes()).await;
                }
            }
        } else {
            let msg = format!("bash: {}: command not found\n", line);
            emit(&mut err, msg.as_bytes()).await;
        }
    }
}

fn parse_header(rest: &str) -> Option<(u32, usize, String)> {
    let mut parts = rest.splitn(3, ' ');
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let size = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();
    Some((mode, size, name))
}

async fn fatal(out: &mut DuplexStream, msg: &str) {
    emit(out, format!("\x02{}\n", msg).as_bytes()).await;
}

async fn run_sink(shared: SharedState, base: String, ends: RemoteEnds) {
    let mut reader = BufReader::new(ends.stdin);
    let mut out = ends.stdout;
    let _stderr = ends.stderr;
    let mut dirs = vec![normalize(&base)];

    // ready
    emit(&mut out, &[0]).await;

    loop {
        let mut raw = Vec::new();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&raw).trim_end_matches('\n').to_string();
        shared.lock().unwrap().transcript.push(line.clone());
        let current = dirs.last().cloned().unwrap_or_default();

        let kind = line.chars().next();
        match kind {
            Some('D') | Some('C') => {
                let Some((mode, size, name)) = parse_header(&line[1..]) else {
                    fatal(&mut out, "scp: protocol error: bad header").await;
                    return;
                };
                let path = join(&current, &name);
                let failure = {
                    let state = shared.lock().unwrap();
                    if state.fatal_names.contains(&name) {
                        Some(format!("scp: {}: Permission denied", path))
                    } else if !matches!(state.fs.get(&current), Some(RemoteNode::Dir { .. })) {
                        Some(format!("scp: {}: No such file or directory", current))
                    } else if kind == Some('D')
                        && matches!(state.fs.get(&path), Some(RemoteNode::File { .. }))
                    {
                        Some(format!("scp: {}: Not a directory", path))
                    } else {
                        None
                    }
                };
                if let Some(msg) = failure {
                    fatal(&mut out, &msg).await;
                    return;
                }

                if kind == Some('D') {
                    shared
                        .lock()
                        .unwrap()
                        .fs
                        .entry(path.clone())
                        .or_insert(RemoteNode::Dir { mode });
                    dirs.push(path);
                    emit(&mut out, &[0]).await;
                    continue;
                }

                emit(&mut out, &[0]).await;
                let mut data = vec![0u8; size];
                if reader.read_exact(&mut data).await.is_err() {
                    return;
                }
                let mut nul = [0u8; 1];
                if reader.read_exact(&mut nul).await.is_err() || nul[0] != 0 {
                    return;
                }
                let warn = {
                    let mut state = shared.lock().unwrap();
                    state.fs.insert(path.clone(), RemoteNode::File { mode, data });
                    state.warn_names.contains(&name)
                };
                if warn {
                    let msg = format!("\x01scp: {}: set mode: Operation not permitted\n", path);
                    emit(&mut out, msg.as_bytes()).await;
                } else {
                    emit(&mut out, &[0]).await;
                }
            }
            Some('E') => {
                if dirs.len() > 1 {
                    dirs.pop();
                }
                emit(&mut out, &[0]).await;
            }
            Some('T') => emit(&mut out, &[0]).await,
            _ => {
                fatal(&mut out, &format!("scp: protocol error: unexpected '{}'", line)).await;
                return;
            }
        }
    }
}
