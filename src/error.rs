//! Error types for execd.

use thiserror::Error;

/// Main error type for the worker.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Failed to spawn child: {0}")]
    Spawn(String),

    #[error("Not a usable socket descriptor: {0}")]
    BadSocketFd(i32),
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
