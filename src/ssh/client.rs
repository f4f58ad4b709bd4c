//! Dialing and authenticating the SSH connection

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::Disconnect;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::channel::SshProcessChannel;
use crate::config::{AuthMethod, ConnectConfig};
use crate::error::{Error, Result};
use crate::process::{Connection, ProcessChannel};

/// Keepalive sent while the connection sits idle between commands
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Client-side russh handler.
///
/// Host keys are not verified; every server key is accepted.
pub(crate) struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH connection that hands out exec channels.
pub struct SshConnection {
    handle: Handle<ClientHandler>,
    target: String,
}

impl SshConnection {
    /// Dial, handshake and authenticate once, bounded by the config timeout.
    pub async fn dial(config: &ConnectConfig) -> Result<Self> {
        let deadline = config.connect_timeout();
        match timeout(deadline, Self::dial_inner(config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} did not answer within {:?}",
                config.display_string(),
                deadline
            ))),
        }
    }

    /// Dial repeatedly until the retry deadline.
    ///
    /// Each attempt is bounded by the per-attempt timeout and attempts are
    /// spaced by the retry interval. Credential and key errors end the loop
    /// at once.
    pub async fn dial_with_retry(config: &ConnectConfig) -> Result<Self> {
        let limit = config.retry.attempt_timeout();
        retry_until(config.retry.interval(), config.retry_deadline(), || async move {
            timeout(limit, Self::dial_inner(config))
                .await
                .map_err(|_| Error::Timeout(format!("attempt exceeded {:?}", limit)))?
        })
        .await
    }

    async fn dial_inner(config: &ConnectConfig) -> Result<Self> {
        let target = config.display_string();
        debug!("[ssh] connecting to {}", target);

        let ssh_config = client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };
        let mut handle = client::connect(Arc::new(ssh_config), config.address(), ClientHandler)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", target, e)))?;

        authenticate(&mut handle, config).await?;
        info!("[ssh] connected to {}", target);

        Ok(Self { handle, target })
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, config: &ConnectConfig) -> Result<()> {
    let username = config.username.clone();
    let accepted = match &config.auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(username, password.clone())
            .await
            .map_err(|e| Error::Auth(e.to_string()))?
            .success(),
        AuthMethod::Key { passphrase, .. } => {
            let path = config
                .auth
                .resolved_key_path()
                .ok_or_else(|| Error::Key("no private key path".into()))?;
            let key = load_secret_key(&path, passphrase.as_deref())
                .map_err(|e| Error::Key(format!("{}: {}", path.display(), e)))?;
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| Error::Connection(e.to_string()))?
                .flatten();
            handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
                .map_err(|e| Error::Auth(e.to_string()))?
                .success()
        }
    };

    if !accepted {
        return Err(Error::Auth(format!(
            "server rejected credentials for {}",
            config.display_string()
        )));
    }
    Ok(())
}

/// Run `attempt` until it succeeds, an auth failure occurs or `deadline` passes.
pub(crate) async fn retry_until<T, F, Fut>(
    interval: Duration,
    deadline: Duration,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut tries = 0u32;
    loop {
        tries += 1;
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_auth_failure() => return Err(e),
            Err(e) => e,
        };

        if started.elapsed() + interval >= deadline {
            return Err(Error::Timeout(format!(
                "gave up after {} attempts: {}",
                tries, err
            )));
        }
        warn!("[ssh] connect attempt {} failed: {}, retrying", tries, err);
        tokio::time::sleep(interval).await;
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn open_channel(&self) -> Result<Box<dyn ProcessChannel>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ChannelOpen(e.to_string()))?;
        debug!("[ssh] opened channel {:?} on {}", channel.id(), self.target);
        Ok(Box::new(SshProcessChannel::new(channel)))
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        info!("[ssh] disconnected from {}", self.target);
        Ok(())
    }
}
