//! SCP Sink Client
//!
//! Pushes local files and directory trees to a remote host by speaking the
//! source side of the SCP protocol to `scp -tr <dir>` processes.
//!
//! Every directory level gets its own sink process: files first, then an
//! empty `D`/`E` pair per subdirectory, then the sink is closed and each
//! subdirectory is sent through a fresh sink rooted inside it.
//!
//! # Error semantics
//! A fatal ack aborts the whole upload with the remote message. Nothing is
//! rolled back on the remote side; the failed level's sink is closed by its
//! [`SinkGuard`].

pub mod protocol;
mod sink;
mod upload;

pub use protocol::ScpAck;
pub use sink::{ScpSink, SinkGuard};
pub use upload::copy_to;
