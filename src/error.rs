// src/error.rs

use std::time::Duration;
use thiserror::Error;

use crate::sys::traits::ShellError;

pub type UnlockResult<T> = Result<T, UnlockError>;

/// Every failure the unlock/reboot core can surface.
///
/// Single-host invocations hand the first of these straight to the caller.
/// Watch monitors catch them at the per-host loop boundary instead.
#[derive(Debug, Error)]
pub enum UnlockError {
    /// Malformed or missing settings. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Refused connection or failed authentication. Fatal within the current attempt.
    #[error("connection error: {0}")]
    Connection(String),

    /// A phase budget (`connect-timeout`, `boot-timeout`, `scan-timeout`) ran out.
    #[error("timed out after {}: {what}", format_budget(.after))]
    Timeout { what: String, after: Duration },

    /// The passphrase pipe never showed up inside the pre-boot environment.
    #[error("decryption prompt not found: {0}")]
    DecryptionPromptNotFound(String),

    /// The secret store (or the operator) did not yield a passphrase.
    #[error("password resolution failed: {0}")]
    PasswordResolution(String),

    /// The operator declined to continue.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Spawning a local helper process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UnlockError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }
}

impl From<ShellError> for UnlockError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::TimedOut { target, after } => {
                Self::timeout(format!("{target} to answer"), after)
            }
            ShellError::Spawn { program, source } => Self::Io(std::io::Error::new(
                source.kind(),
                format!("failed to spawn {program}: {source}"),
            )),
            other => Self::Connection(other.to_string()),
        }
    }
}

fn format_budget(after: &Duration) -> String {
    humantime::format_duration(*after).to_string()
}
