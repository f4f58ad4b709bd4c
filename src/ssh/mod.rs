//! SSH transport
//!
//! Implements [`crate::process::Connection`] and
//! [`crate::process::ProcessChannel`] with russh. Everything above this
//! module only sees byte streams.

mod channel;
mod client;

pub use client::SshConnection;
