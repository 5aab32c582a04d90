// src/sys/traits.rs

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{Endpoint, SshTarget};
use crate::sys::keyscan::ServerDetails;
use crate::sys::secrets::Passphrase;

// ==============================================================================
// 1. Remote command execution (already-authenticated session abstraction)
// ==============================================================================

/// One command to run on the far side of an SSH session.
/// 🛡️ Discrete argv entries. The session layer quotes each one for the remote shell.
pub struct RemoteCommand {
    pub argv: Vec<String>,
    /// Fed to the remote command's stdin and scrubbed from RAM on drop.
    pub stdin: Option<Zeroizing<Vec<u8>>>,
    /// Local wall-clock bound covering connection setup and execution.
    pub timeout: Duration,
}

impl RemoteCommand {
    pub fn new<I, S>(argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, payload: Zeroizing<Vec<u8>>) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Why a remote command did not produce a [`CommandOutput`].
#[derive(Debug, Error)]
pub enum ShellError {
    /// Nothing is listening yet (or the listener hung up during startup). Worth retrying.
    #[error("{target} is not accepting SSH connections: {detail}")]
    NotListening { target: String, detail: String },

    /// The server answered and said no (authentication, host key). Not worth retrying.
    #[error("{target} refused the SSH session: {detail}")]
    Refused { target: String, detail: String },

    #[error("{target} did not answer within {after:?}")]
    TimedOut { target: String, after: Duration },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShellError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotListening { .. } | Self::TimedOut { .. })
    }
}

/// Sorts the stderr of a failed `ssh` client (exit status 255) into
/// "try again later" and "the server said no".
pub fn classify_ssh_failure(target: &str, stderr: &str) -> ShellError {
    let detail = stderr.trim().lines().last().unwrap_or("ssh exited with status 255");
    let lowercase = stderr.to_lowercase();

    // pam_nologin rejects logins while the booted system is still starting.
    let booting = ["system is booting up", "pam_nologin"];
    let refusals = [
        "permission denied",
        "host key verification failed",
        "remote host identification has changed",
        "too many authentication failures",
        "no more authentication methods",
    ];

    if !booting.iter().any(|p| lowercase.contains(p))
        && refusals.iter().any(|p| lowercase.contains(p))
    {
        return ShellError::Refused {
            target: target.to_string(),
            detail: detail.to_string(),
        };
    }

    ShellError::NotListening {
        target: target.to_string(),
        detail: detail.to_string(),
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` on `target`. A non-zero remote exit status is still `Ok`.
    async fn execute(
        &self,
        target: &SshTarget,
        command: RemoteCommand,
    ) -> Result<CommandOutput, ShellError>;

    /// Collects the SSH banner and host keys of `endpoint` (ssh-keyscan),
    /// from the proxy host when one is given.
    async fn scan(
        &self,
        endpoint: &Endpoint,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<ServerDetails, ShellError>;

    /// Hands the terminal to an interactive login shell on `target`.
    async fn interactive_shell(&self, target: &SshTarget) -> Result<(), ShellError>;

    /// Runs `argv` on `target` with the operator's terminal attached and
    /// returns its exit status.
    async fn run_on_terminal(&self, target: &SshTarget, argv: Vec<String>)
    -> Result<i32, ShellError>;
}

// ==============================================================================
// 2. External secret store
// ==============================================================================

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Looks up the passphrase stored under `name`.
    async fn lookup(&self, name: &str, store_dir: Option<&Path>) -> Result<Passphrase, String>;
}

// ==============================================================================
// 3. Operator console
// ==============================================================================

/// The person at the terminal. Only consulted on interactive runs.
#[async_trait]
pub trait Console: Send + Sync {
    /// Reads a line without echoing it.
    async fn read_password(&self, prompt: &str) -> std::io::Result<Passphrase>;

    /// Asks a yes/no question. Anything but an explicit yes is a no.
    async fn confirm(&self, question: &str) -> std::io::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_are_not_retried() {
        let err = classify_ssh_failure(
            "root@db1:2222",
            "root@db1: Permission denied (publickey).\r\n",
        );
        assert!(matches!(err, ShellError::Refused { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn early_boot_noise_is_retried() {
        for stderr in [
            "ssh: connect to host db1 port 2222: Connection refused",
            "ssh: connect to host db1 port 22: No route to host",
            "kex_exchange_identification: read: Connection reset by peer",
            "System is booting up. Unprivileged users are not permitted to log in yet.\nPermission denied (publickey).",
        ] {
            assert!(classify_ssh_failure("db1", stderr).is_transient(), "{stderr}");
        }
    }
}
