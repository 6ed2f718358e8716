//! Error types of the judge engine

use std::path::PathBuf;
use thiserror::Error;

/// Failures while setting up or tearing down a sandbox session
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("Failed to fork sandbox child: {0}")]
    Fork(#[source] nix::Error),

    #[error("Cgroup operation on {path:?} failed: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cgroup {path:?} still present after {attempts} removal attempts")]
    CgroupBusy { path: PathBuf, attempts: u32 },

    #[error("Cgroup v2 is not usable at {path:?}: {reason}")]
    CgroupUnavailable { path: PathBuf, reason: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid limits: {0}")]
    InvalidLimits(String),

    #[error("Invalid seccomp policy: {0}")]
    Policy(String),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to wait for sandbox child: {0}")]
    Wait(#[source] nix::Error),
}

impl SandboxError {
    pub fn cgroup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SandboxError::Cgroup {
            path: path.into(),
            source,
        }
    }
}

/// Failures of a whole submission, delivered through the manager callback
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Judge queue is closed")]
    QueueClosed,

    #[error("Judging panicked: {0}")]
    Panicked(String),
}
