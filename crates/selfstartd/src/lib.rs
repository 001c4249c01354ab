//! selfstartd — the SelfStart control-plane daemon.
//!
//! Wires the five control loops (discovery, orchestration, proxying,
//! scaling, shutdown) around a shared registry store and hook bus, and owns
//! their lifecycle. The public HTTP/WebSocket façade runs as a separate
//! collaborator process against the store and this daemon's state.

#![forbid(unsafe_code)]

pub mod config;
pub mod daemon;
pub mod error;

pub use config::DaemonConfig;
pub use daemon::{Daemon, OrchestratorScaleExecutor};
pub use error::{DaemonError, DaemonResult};
