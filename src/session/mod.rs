//! Session
//!
//! One SSH connection carrying a persistent shell for [`Session::run`] and
//! short-lived SCP sink channels for [`Session::copy_to`].
//!
//! # Lifecycle
//!
//! ```text
//!   connect ──▸ open ──run──▸ shell spawned (lazily) ──run──▸ ...
//!                 │                 │ exited
//!                 │                 ▾
//!                 │           next run restarts it
//!                 ▾
//!               close ──▸ every later call fails with Error::Closed
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnectConfig;
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, Shell};
use crate::process::Connection;
use crate::scp;
use crate::ssh::SshConnection;

pub struct Session {
    connection: Arc<dyn Connection>,
    shell: Mutex<Option<Shell>>,
    shell_command: String,
    closed: AtomicBool,
    /// Fired by `close`; aborts any `run` still waiting for the shell.
    cancel: CancellationToken,
}

impl Session {
    /// Dial once with the configured timeout.
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        let connection = SshConnection::dial(config).await?;
        Ok(Self::with_connection(Arc::new(connection), &config.shell))
    }

    /// Dial with the configured retry policy.
    pub async fn connect_with_retry(config: &ConnectConfig) -> Result<Self> {
        let connection = SshConnection::dial_with_retry(config).await?;
        Ok(Self::with_connection(Arc::new(connection), &config.shell))
    }

    /// Build a session over an already established connection.
    pub fn with_connection(connection: Arc<dyn Connection>, shell_command: &str) -> Self {
        Self {
            connection,
            shell: Mutex::new(None),
            shell_command: shell_command.to_string(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `command` in the persistent shell.
    ///
    /// Commands run one at a time: a call waits until the previous command's
    /// output has been drained or dropped. Working directory and shell
    /// variables carry over from earlier commands unless the shell had to be
    /// restarted. A call still waiting when [`Session::close`] runs fails
    /// with [`Error::Closed`].
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.ensure_open()?;
        tokio::select! {
            result = self.run_in_shell(command) => result,
            () = self.cancel.cancelled() => Err(Error::Closed),
        }
    }

    async fn run_in_shell(&self, command: &str) -> Result<CommandOutput> {
        let mut slot = self.shell.lock().await;

        if let Some(shell) = slot.as_mut() {
            match shell.run(command).await {
                Err(Error::ShellExited) => {}
                other => return other,
            }
        }

        if let Some(mut dead) = slot.take() {
            warn!("[shell] '{}' exited, starting a new one", self.shell_command);
            dead.close().await;
        }
        let shell = slot.insert(Shell::spawn(self.connection.as_ref(), &self.shell_command).await?);
        shell.run(command).await
    }

    /// Upload a local file or directory into the remote directory `target`.
    pub async fn copy_to(&self, source: impl AsRef<Path>, target: &str) -> Result<()> {
        self.ensure_open()?;
        scp::copy_to(self.connection.as_ref(), source.as_ref(), target).await
    }

    /// Close the shell, then the connection.
    ///
    /// Does not wait for undrained output of earlier commands.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(mut shell) = self.shell.lock().await.take() {
            shell.close().await;
        }
        self.connection.close().await?;
        info!("[session] closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}
