//! Daemon error types and exit codes

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(String),

    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("registry store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    /// CLI exit code: 0 success, 1 generic, 2 config, 3 runtime, 4 store.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::RuntimeUnreachable(_) => 3,
            Self::StoreUnreachable(_) => 4,
            Self::Other(_) => 1,
        }
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;
