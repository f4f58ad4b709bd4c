//! Configuration Module
//!
//! Connection settings for dialing a [`crate::Session`]. There is no config
//! file or CLI layer; host applications build or deserialize these values.

pub mod types;

pub use types::{default_key_path, AuthMethod, ConnectConfig, RetryConfig};
