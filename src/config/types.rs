//! Configuration Types
//!
//! Plain connection settings a host application fills in or deserializes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout used when `timeout_secs` is 0 (one year, effectively unlimited)
const UNLIMITED_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Authentication method
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Plaintext password
    Password { password: String },
    /// Private key file
    Key {
        /// Path to private key file (defaults to `~/.ssh/id_rsa`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_path: Option<PathBuf>,
        /// Passphrase for encrypted keys
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        AuthMethod::Password {
            password: password.into(),
        }
    }

    /// Key auth with the default key location
    pub fn default_key() -> Self {
        AuthMethod::Key {
            key_path: None,
            passphrase: None,
        }
    }

    /// Key file to load, if this is key auth
    pub fn resolved_key_path(&self) -> Option<PathBuf> {
        match self {
            AuthMethod::Password { .. } => None,
            AuthMethod::Key { key_path, .. } => {
                Some(key_path.clone().unwrap_or_else(default_key_path))
            }
        }
    }
}

/// `~/.ssh/id_rsa`
pub fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ssh")
        .join("id_rsa")
}

/// Dial retry policy for [`crate::Session::connect_with_retry`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay between attempts
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Timeout applied to each individual attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Overall deadline (0 = use the connect timeout)
    #[serde(default)]
    pub deadline_secs: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_attempt_timeout_secs() -> u64 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            deadline_secs: 0,
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Everything needed to dial one SSH connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// SSH host
    pub host: String,

    /// SSH port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// SSH username
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Dial + handshake timeout in seconds (0 = unlimited)
    #[serde(default)]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Command line of the persistent shell used by `run`
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_port() -> u16 {
    22
}

pub(crate) fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl ConnectConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            timeout_secs: 0,
            retry: RetryConfig::default(),
            shell: default_shell(),
        }
    }

    /// Build from a `host:port` string; a missing port means 22.
    pub fn from_hostport(
        hostport: &str,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (hostport, default_port()),
            },
            _ => (hostport, default_port()),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Self::new(host, port, username, auth)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Dial + handshake timeout
    pub fn connect_timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            UNLIMITED_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Overall deadline for the retry loop
    pub fn retry_deadline(&self) -> Duration {
        if self.retry.deadline_secs == 0 {
            self.connect_timeout()
        } else {
            Duration::from_secs(self.retry.deadline_secs)
        }
    }

    /// `host:port` for dialing, IPv6 literals bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Get display string (user@host:port)
    pub fn display_string(&self) -> String {
        if self.port == 22 {
            format!("{}@{}", self.username, self.host)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        }
    }
}
