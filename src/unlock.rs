// src/unlock.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{HostProfile, PreBootSettings, SshTarget, Timeouts};
use crate::error::{UnlockError, UnlockResult};
use crate::probe::{ConnectionProbe, Reachability};
use crate::sys::Backend;
use crate::sys::inspect::{find_emergency_shell, find_process_id};
use crate::sys::secrets::{Interaction, Passphrase, resolve_password};
use crate::sys::traits::{
    CommandOutput, Console, RemoteCommand, RemoteShell, SecretStore, ShellError,
};

// ==============================================================================
// 1. Remote scripts
// ==============================================================================

/// Waits up to `$2` seconds for the FIFO `$1`, then copies stdin into it.
/// Exits with `PIPE_MISSING_STATUS` when the FIFO never shows up.
pub(crate) const WRITE_PIPE_SCRIPT: &str = r#"i=0
while [ ! -p "$1" ]; do
  [ "$i" -ge "$2" ] && exit 3
  sleep 1
  i=$((i + 1))
done
cat > "$1""#;

pub(crate) const PIPE_MISSING_STATUS: i32 = 3;

/// Replaces the file `$1` with stdin.
pub(crate) const WRITE_FILE_SCRIPT: &str = r#"cat > "$1""#;

/// Floor for any single remote call, so a tiny scan-timeout still leaves room to connect.
const MIN_CALL_BUDGET: Duration = Duration::from_secs(10);

/// How the passphrase reached the decryption subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMethod {
    NamedPipe,
    /// The initramfs had no FIFO; the cryptroot script was rerun with a key script.
    KeyScript,
    /// The operator typed the passphrase into a restarted cryptroot prompt.
    InteractivePrompt,
}

// ==============================================================================
// 2. PreBootUnlocker
// ==============================================================================

/// Injects the disk encryption passphrase into a waiting pre-boot environment.
pub struct PreBootUnlocker {
    shell: Arc<dyn RemoteShell>,
    secrets: Arc<dyn SecretStore>,
    console: Arc<dyn Console>,
    interaction: Interaction,
}

impl PreBootUnlocker {
    pub fn new(backend: &Backend, interaction: Interaction) -> Self {
        Self {
            shell: backend.shell.clone(),
            secrets: backend.secrets.clone(),
            console: backend.console.clone(),
            interaction,
        }
    }

    /// Unlocks the root disk of `profile`. The pre-boot endpoint is expected to be up.
    pub async fn unlock(&self, profile: &HostProfile) -> UnlockResult<UnlockMethod> {
        let settings = profile.pre_boot()?;
        let timeouts = &profile.timeouts;
        let target = settings.target();

        info!(endpoint = %target, "testing SSH connection to the pre-boot environment");
        let probe = ConnectionProbe::new(self.shell.clone(), timeouts);
        match probe.probe_once(&target).await {
            Reachability::Reachable => info!("connected and authenticated over SSH"),
            Reachability::Unreachable => debug!("pre-boot environment went quiet, will retry"),
            Reachability::Error(reason) => return Err(refusal(settings, &reason)),
        }

        // 🛡️ Resolved once for the whole attempt, scrubbed when this function returns.
        let passphrase = resolve_password(
            settings.password.as_ref(),
            self.secrets.as_ref(),
            self.console.as_ref(),
            self.interaction,
            &profile.alias,
        )
        .await?;

        match &passphrase {
            Some(passphrase) => {
                if let Some(method) = self.offer_password(&target, settings, passphrase, timeouts).await? {
                    return Ok(method);
                }
                warn!(
                    pipe = %settings.named_pipe,
                    config = %settings.cryptroot_config,
                    "named pipe and cryptroot configuration are both missing, \
                     the passphrase cannot be offered non-interactively"
                );
            }
            None => info!("no password available, the passphrase cannot be offered non-interactively"),
        }
        self.open_remote_prompt(&target, settings, timeouts).await
    }

    /// Named pipe first, key script second. `None` when neither exists.
    async fn offer_password(
        &self,
        target: &SshTarget,
        settings: &PreBootSettings,
        passphrase: &Passphrase,
        timeouts: &Timeouts,
    ) -> UnlockResult<Option<UnlockMethod>> {
        let started = Instant::now();
        loop {
            let failure = match self.write_to_pipe(target, settings, passphrase, timeouts).await {
                Ok(output) if output.success() => {
                    info!(pipe = %settings.named_pipe, "passphrase delivered to the decryption prompt");
                    return Ok(Some(UnlockMethod::NamedPipe));
                }
                Ok(output) if output.status == PIPE_MISSING_STATUS => {
                    return self
                        .fall_back_to_key_script(target, settings, passphrase, timeouts)
                        .await;
                }
                Ok(output) => format!(
                    "writing to {} exited with status {}: {}",
                    settings.named_pipe,
                    output.status,
                    output.stderr.trim()
                ),
                Err(ShellError::Refused { detail, .. }) => return Err(refusal(settings, &detail)),
                Err(err @ ShellError::Spawn { .. }) => return Err(err.into()),
                Err(err) => err.to_string(),
            };

            if started.elapsed() + timeouts.retry_interval > timeouts.connect_timeout {
                return Err(UnlockError::timeout(
                    format!("delivering the passphrase to {target} (last failure: {failure})"),
                    timeouts.connect_timeout,
                ));
            }
            debug!(%failure, "passphrase write failed, retrying");
            sleep(timeouts.retry_interval).await;
        }
    }

    async fn write_to_pipe(
        &self,
        target: &SshTarget,
        settings: &PreBootSettings,
        passphrase: &Passphrase,
        timeouts: &Timeouts,
    ) -> Result<CommandOutput, ShellError> {
        let wait_seconds = timeouts.scan_timeout.as_secs().max(1);
        let command = RemoteCommand::new(
            [
                "sh".to_string(),
                "-c".to_string(),
                WRITE_PIPE_SCRIPT.to_string(),
                "unlock".to_string(),
                settings.named_pipe.clone(),
                wait_seconds.to_string(),
            ],
            timeouts.scan_timeout + call_budget(timeouts),
        )
        .with_stdin(passphrase.line_payload());
        self.shell.execute(target, command).await
    }

    // ==========================================================================
    // 3. Key script fallback (initramfs without a passphrase FIFO)
    // ==========================================================================

    async fn fall_back_to_key_script(
        &self,
        target: &SshTarget,
        settings: &PreBootSettings,
        passphrase: &Passphrase,
        timeouts: &Timeouts,
    ) -> UnlockResult<Option<UnlockMethod>> {
        let budget = call_budget(timeouts);
        info!(config = %settings.cryptroot_config, "named pipe missing, checking for cryptroot configuration");
        if !self.exists(target, &settings.cryptroot_config, budget).await? {
            return Ok(None);
        }

        self.kill_interactive_prompt(target, settings, budget).await?;

        info!(path = %settings.key_script, "creating key script");
        self.write_file(target, &settings.key_script, key_script_contents(passphrase), budget)
            .await?;
        self.run(target, ["chmod", "700", settings.key_script.as_str()], budget)
            .await?;

        info!(path = %settings.cryptroot_config, "updating cryptroot configuration");
        let current = self
            .run(target, ["cat", settings.cryptroot_config.as_str()], budget)
            .await?;
        if !current.success() {
            return Err(UnlockError::Connection(format!(
                "failed to read {} on {target}: {}",
                settings.cryptroot_config,
                current.stderr.trim()
            )));
        }
        let rewritten: String = current
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| format!("{},keyscript={}\n", line.trim(), settings.key_script))
            .collect();
        self.write_file(
            target,
            &settings.cryptroot_config,
            Zeroizing::new(rewritten.into_bytes()),
            budget,
        )
        .await?;

        info!(program = %settings.cryptroot_program, "restarting cryptroot program");
        let rerun = self
            .run(target, [settings.cryptroot_program.as_str()], timeouts.connect_timeout)
            .await?;
        if !rerun.success() {
            warn!(status = rerun.status, "cryptroot program reported a failure");
        }

        self.kill_emergency_shell(target, budget).await?;
        Ok(Some(UnlockMethod::KeyScript))
    }

    // ==========================================================================
    // 4. Last resort: the operator answers the prompt over a terminal
    // ==========================================================================

    async fn open_remote_prompt(
        &self,
        target: &SshTarget,
        settings: &PreBootSettings,
        timeouts: &Timeouts,
    ) -> UnlockResult<UnlockMethod> {
        let budget = call_budget(timeouts);
        let available = self.interaction == Interaction::Interactive
            && self.exists(target, &settings.cryptroot_program, budget).await?;
        if !available {
            let reason = if self.interaction == Interaction::Interactive {
                format!(
                    "the named pipe {}, configuration file {} and program file {} are all missing on {target}",
                    settings.named_pipe, settings.cryptroot_config, settings.cryptroot_program
                )
            } else {
                format!(
                    "neither the named pipe {} nor the configuration file {} exist on {target} \
                     and nobody is around to answer {}",
                    settings.named_pipe, settings.cryptroot_config, settings.cryptroot_program
                )
            };
            return Err(UnlockError::DecryptionPromptNotFound(format!(
                "{reason}, could it be that the system has already booted?"
            )));
        }

        info!(program = %settings.cryptroot_program, "opening an interactive prompt instead");
        self.kill_interactive_prompt(target, settings, budget).await?;
        let status = self
            .shell
            .run_on_terminal(target, vec![settings.cryptroot_program.clone()])
            .await?;
        if status != 0 {
            warn!(status, "cryptroot program reported a failure");
        }
        self.kill_emergency_shell(target, budget).await?;
        Ok(UnlockMethod::InteractivePrompt)
    }

    async fn exists(&self, target: &SshTarget, path: &str, budget: Duration) -> UnlockResult<bool> {
        Ok(self.run(target, ["test", "-f", path], budget).await?.success())
    }

    async fn kill_interactive_prompt(
        &self,
        target: &SshTarget,
        settings: &PreBootSettings,
        budget: Duration,
    ) -> UnlockResult<()> {
        let listing = self.run(target, ["ps"], budget).await?;
        match find_process_id(&listing.stdout, &settings.cryptroot_program) {
            Some(pid) => {
                info!(pid, "killing interactive prompt");
                self.run(target, ["kill".to_string(), "-9".to_string(), pid.to_string()], budget)
                    .await?;
            }
            None => warn!(
                "failed to identify the interactive prompt process, the boot may block on it \
                 and need manual intervention"
            ),
        }
        Ok(())
    }

    async fn kill_emergency_shell(&self, target: &SshTarget, budget: Duration) -> UnlockResult<()> {
        let listing = self.run(target, ["ps"], budget).await?;
        match find_emergency_shell(&listing.stdout) {
            Some(pid) => {
                info!(pid, "killing emergency shell to resume the boot");
                self.run(target, ["kill".to_string(), "-9".to_string(), pid.to_string()], budget)
                    .await?;
            }
            None => warn!("no emergency shell found, the boot may need manual intervention"),
        }
        Ok(())
    }

    async fn write_file(
        &self,
        target: &SshTarget,
        path: &str,
        contents: Zeroizing<Vec<u8>>,
        budget: Duration,
    ) -> UnlockResult<()> {
        let command = RemoteCommand::new(["sh", "-c", WRITE_FILE_SCRIPT, "write", path], budget)
            .with_stdin(contents);
        let output = self.shell.execute(target, command).await?;
        if !output.success() {
            return Err(UnlockError::Connection(format!(
                "failed to write {path} on {target}: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn run<I, S>(&self, target: &SshTarget, argv: I, budget: Duration) -> UnlockResult<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.shell.execute(target, RemoteCommand::new(argv, budget)).await?)
    }
}

fn call_budget(timeouts: &Timeouts) -> Duration {
    timeouts.scan_timeout.max(MIN_CALL_BUDGET)
}

fn refusal(settings: &PreBootSettings, reason: &str) -> UnlockError {
    let mut message = format!(
        "failed to authenticate to {}:{}: {reason}",
        settings.endpoint.host, settings.endpoint.port
    );
    if settings.endpoint.user == "root" {
        message.push_str(
            " (maybe this is the post-boot environment and you don't have 'root' access there?)",
        );
    }
    UnlockError::Connection(message)
}

/// `echo -n '<passphrase>'`, single-quoted for the initramfs shell.
fn key_script_contents(passphrase: &Passphrase) -> Zeroizing<Vec<u8>> {
    passphrase.use_secret(|raw| {
        let mut script = Zeroizing::new(Vec::with_capacity(raw.len() + 16));
        script.extend_from_slice(b"echo -n '");
        for byte in raw {
            if *byte == b'\'' {
                script.extend_from_slice(b"'\\''");
            } else {
                script.push(*byte);
            }
        }
        script.extend_from_slice(b"'\n");
        script
    })
}
