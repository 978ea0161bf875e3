//! Cooperative shutdown for background loops.
//!
//! The config watcher and the coordinator's periodic passes select on a
//! [`ShutdownToken`] so a host process can stop them cleanly.

mod shutdown;

pub use shutdown::ShutdownToken;
