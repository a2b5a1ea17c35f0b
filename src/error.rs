//! Error types for rpmirror

use thiserror::Error;

/// Failure of a single external command or package fetch.
///
/// The engine's retry loop keys off [`FetchError::is_retryable`]: timeouts
/// and transient command failures are retried, a package that upstream does
/// not know about is terminal.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("'{command}' exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("no match for {0} in enabled repositories")]
    NotFound(String),

    #[error("downloaded file missing from staging directory: {0}")]
    MissingArtifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::CommandFailed { .. } => true,
            FetchError::Io(_) => true,
            FetchError::MissingArtifact(_) => true,
            FetchError::Spawn { .. } => false,
            FetchError::NotFound(_) => false,
        }
    }
}

/// Terminal errors that abort the run before core work begins.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mirror root is not accessible: {0}")]
    MirrorRootInaccessible(String),

    #[error("No enabled upstream sources found")]
    NoSources,

    #[error("Failed to query installed packages: {0}")]
    Inventory(String),
}
