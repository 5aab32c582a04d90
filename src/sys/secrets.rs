// src/sys/secrets.rs

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::PasswordSource;
use crate::error::{UnlockError, UnlockResult};
use crate::sys::traits::{Console, SecretStore};

/// Disk encryption passphrase for exactly one unlock attempt.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. The heap allocation is zeroized when the value goes out of scope, so
///    dropping it at the end of an attempt is all the cleanup there is.
pub struct Passphrase {
    secret: Secret<Vec<u8>>,
}

impl Passphrase {
    /// Takes ownership of the raw bytes so no plaintext copy is left behind.
    pub fn new(raw: Vec<u8>) -> Self {
        Self {
            secret: Secret::new(raw),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secret.expose_secret().is_empty()
    }

    /// Exposes the plaintext to `action` only. The slice cannot escape the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        action(self.secret.expose_secret())
    }

    /// The passphrase followed by a line terminator, as the decryption prompt reads it.
    pub fn line_payload(&self) -> Zeroizing<Vec<u8>> {
        self.use_secret(|raw| {
            let mut payload = Zeroizing::new(Vec::with_capacity(raw.len() + 1));
            payload.extend_from_slice(raw);
            payload.push(b'\n');
            payload
        })
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase([REDACTED])")
    }
}

/// Whether the operator can be asked for anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    /// A terminal is attached; prompting is allowed.
    Interactive,
    /// Watch mode and other unattended runs.
    Unattended,
}

impl Interaction {
    pub fn detect() -> Self {
        use std::os::fd::AsRawFd;
        match nix::unistd::isatty(std::io::stdin().as_raw_fd()) {
            Ok(true) => Self::Interactive,
            _ => Self::Unattended,
        }
    }
}

/// Resolves the configured password reference into a [`Passphrase`].
///
/// Called once per unlock attempt, at the moment the passphrase is needed.
/// `Ok(None)` means the operator is around but has no password to offer, so
/// the decryption prompt has to be answered on the remote terminal instead.
pub async fn resolve_password(
    source: Option<&PasswordSource>,
    store: &dyn SecretStore,
    console: &dyn Console,
    interaction: Interaction,
    host: &str,
) -> UnlockResult<Option<Passphrase>> {
    let passphrase = match (source, interaction) {
        (Some(PasswordSource::Literal(value)), _) => {
            Passphrase::new(value.expose_secret().as_bytes().to_vec())
        }
        (Some(PasswordSource::Store { name, store_dir }), _) => store
            .lookup(name, store_dir.as_deref())
            .await
            .map_err(UnlockError::PasswordResolution)?,
        (Some(PasswordSource::Prompt), Interaction::Interactive) => {
            let prompt = format!("Enter disk encryption password for '{host}': ");
            let typed = console.read_password(&prompt).await.map_err(|e| {
                UnlockError::PasswordResolution(format!("failed to read password: {e}"))
            })?;
            if typed.is_empty() {
                debug!(host, "no password entered at the prompt");
                return Ok(None);
            }
            typed
        }
        (None, Interaction::Interactive) => return Ok(None),
        (Some(PasswordSource::Prompt) | None, Interaction::Unattended) => {
            return Err(UnlockError::PasswordResolution(format!(
                "no password configured for {host} and nobody is around to type one"
            )));
        }
    };

    if passphrase.is_empty() {
        return Err(UnlockError::PasswordResolution(format!(
            "empty disk encryption password for {host}"
        )));
    }
    Ok(Some(passphrase))
}

// ==============================================================================
// Controlling terminal
// ==============================================================================

/// `rpassword` for secrets, a plain stdin line for questions.
pub struct TerminalConsole;

#[async_trait]
impl Console for TerminalConsole {
    async fn read_password(&self, prompt: &str) -> io::Result<Passphrase> {
        let prompt = prompt.to_string();
        let typed = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
            .await
            .map_err(io::Error::other)??;
        Ok(Passphrase::new(typed.into_bytes()))
    }

    async fn confirm(&self, question: &str) -> io::Result<bool> {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || -> io::Result<bool> {
            let mut stderr = io::stderr();
            write!(stderr, "{question} [y/N] ")?;
            stderr.flush()?;
            let mut answer = String::new();
            io::stdin().read_line(&mut answer)?;
            Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
        })
        .await
        .map_err(io::Error::other)?
    }
}

// ==============================================================================
// `pass` (the standard unix password manager)
// ==============================================================================

pub struct PassStore;

#[async_trait]
impl SecretStore for PassStore {
    async fn lookup(&self, name: &str, store_dir: Option<&Path>) -> Result<Passphrase, String> {
        // 🛡️ Argument injection guard: a name starting with '-' would be parsed as an option.
        if name.is_empty() || name.starts_with('-') {
            return Err(format!("invalid password name {name:?}"));
        }

        let mut command = Command::new("pass");
        command.arg("show").arg("--").arg(name).kill_on_drop(true);
        if let Some(dir) = store_dir {
            command.env("PASSWORD_STORE_DIR", dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| format!("failed to run 'pass': {e}"))?;

        // Wrap stdout before anything else so every early return scrubs it.
        let stdout = Zeroizing::new(output.stdout);
        if !output.status.success() {
            return Err(format!(
                "'pass show {name}' exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let first_line = stdout.split(|b| *b == b'\n').next().unwrap_or_default();
        if first_line.is_empty() {
            return Err(format!("'pass show {name}' returned an empty first line"));
        }
        Ok(Passphrase::new(first_line.to_vec()))
    }
}
