// src/reboot.rs

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, trace, warn};

use crate::boot::PostBootWaiter;
use crate::config::{HostProfile, SshTarget};
use crate::error::{UnlockError, UnlockResult};
use crate::identify::{Environment, ServerIdentifier};
use crate::loader::HostKeyStore;
use crate::probe::{ConnectionProbe, Reachability};
use crate::sys::Backend;
use crate::sys::inspect::{SourceDevice, lsblk_shows_root, parse_crypttab};
use crate::sys::keyscan::ServerDetails;
use crate::sys::secrets::Interaction;
use crate::sys::traits::{CommandOutput, RemoteCommand, ShellError};
use crate::unlock::PreBootUnlocker;

const INSPECTION_BUDGET: Duration = Duration::from_secs(30);

// ==============================================================================
// 1. Attempt records
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPhase {
    Online,
    RebootIssued,
    Disconnected,
    PreBootPhase,
    PostBootPhase,
    Verified,
    Failed,
}

impl fmt::Display for RebootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Online => "online",
            Self::RebootIssued => "reboot-issued",
            Self::Disconnected => "disconnected",
            Self::PreBootPhase => "pre-boot",
            Self::PostBootPhase => "post-boot",
            Self::Verified => "verified",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    InFlight,
    Verified,
    Failed(String),
}

/// One pass of a host through the reboot/unlock state machine.
#[derive(Debug, Clone)]
pub struct UnlockAttempt {
    pub alias: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Phases entered, in order.
    pub phases: Vec<RebootPhase>,
    pub outcome: AttemptOutcome,
}

impl UnlockAttempt {
    fn begin(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            outcome: AttemptOutcome::InFlight,
        }
    }

    fn enter(&mut self, phase: RebootPhase) {
        info!(host = %self.alias, %phase, "entering phase");
        self.phases.push(phase);
    }

    pub fn is_verified(&self) -> bool {
        self.outcome == AttemptOutcome::Verified
    }
}

// ==============================================================================
// 2. RebootCoordinator
// ==============================================================================

/// Drives one host through reboot, unlock and verification.
///
/// Attempts run through `&mut self`, so a coordinator never has two in flight.
pub struct RebootCoordinator {
    profile: HostProfile,
    backend: Backend,
    interaction: Interaction,
    /// Present exactly when the profile has pre-boot settings.
    identifier: Option<ServerIdentifier>,
    host_key_store: Option<HostKeyStore>,
    open_shell: bool,
    last_attempt: Option<UnlockAttempt>,
}

impl RebootCoordinator {
    pub fn new(profile: HostProfile, backend: Backend, interaction: Interaction) -> Self {
        let identifier = ServerIdentifier::for_profile(backend.shell.clone(), &profile).ok();
        Self {
            profile,
            backend,
            interaction,
            identifier,
            host_key_store: None,
            open_shell: false,
            last_attempt: None,
        }
    }

    /// Opens an interactive shell once the post-boot environment is verified.
    pub fn with_shell(mut self, open_shell: bool) -> Self {
        self.open_shell = open_shell;
        self
    }

    /// Persists host keys seen during successful unlocks.
    pub fn with_host_key_store(mut self, store: HostKeyStore) -> Self {
        self.host_key_store = Some(store);
        self
    }

    pub fn identifier(&self) -> Option<&ServerIdentifier> {
        self.identifier.as_ref()
    }

    pub fn last_attempt(&self) -> Option<&UnlockAttempt> {
        self.last_attempt.as_ref()
    }

    /// Reboots a running host and waits until it is back, unlocking it on the way.
    pub async fn reboot_cycle(&mut self) -> UnlockResult<UnlockAttempt> {
        let mut attempt = UnlockAttempt::begin(&self.profile.alias);
        let result = self.drive_reboot(&mut attempt).await;
        self.finish(attempt, result)
    }

    /// Unlocks a host that is (or is about to be) waiting in its pre-boot environment.
    pub async fn unlock_cycle(&mut self) -> UnlockResult<UnlockAttempt> {
        self.unlock_from(None).await
    }

    /// Unlocks a host whose pre-boot environment was already identified as `server`.
    pub async fn unlock_detected(&mut self, server: ServerDetails) -> UnlockResult<UnlockAttempt> {
        self.unlock_from(Some(server)).await
    }

    async fn unlock_from(&mut self, detected: Option<ServerDetails>) -> UnlockResult<UnlockAttempt> {
        let mut attempt = UnlockAttempt::begin(&self.profile.alias);
        attempt.enter(RebootPhase::Disconnected);
        let result = self.drive_unlock(&mut attempt, detected).await;
        self.finish(attempt, result)
    }

    async fn drive_reboot(&mut self, attempt: &mut UnlockAttempt) -> UnlockResult<()> {
        let timeouts = self.profile.timeouts;
        let post = self.profile.post_boot_target();
        let probe = ConnectionProbe::new(self.backend.shell.clone(), &timeouts);

        attempt.enter(RebootPhase::Online);
        match probe.probe(&post, timeouts.connect_timeout).await {
            Reachability::Reachable => {}
            Reachability::Unreachable => {
                return Err(UnlockError::Connection(format!("{post} is not reachable")));
            }
            Reachability::Error(reason) => {
                return Err(UnlockError::Connection(format!("{post}: {reason}")));
            }
        }
        self.ensure_unlockable(&post).await?;
        let old_uptime = self.uptime(&post).await?;
        info!(
            host = %self.profile.alias,
            uptime = %humantime::format_duration(whole_seconds(old_uptime)),
            "rebooting"
        );

        attempt.enter(RebootPhase::RebootIssued);
        self.issue_reboot(&post).await?;

        probe
            .wait_until_unreachable(&post, timeouts.connect_timeout)
            .await?;
        attempt.enter(RebootPhase::Disconnected);

        let pre_server = match self.profile.has_encryption() {
            true => Some(self.run_pre_boot(attempt, None).await?),
            false => None,
        };

        attempt.enter(RebootPhase::PostBootPhase);
        let waiter = self.post_boot_waiter();
        let arrival = waiter.wait(&post, timeouts.boot_timeout).await?;
        self.wait_for_lower_uptime(
            &post,
            old_uptime,
            timeouts.boot_timeout.saturating_sub(arrival.waited),
        )
        .await?;
        if let Some(pre_server) = pre_server {
            self.record_host_keys(&pre_server, arrival.server).await;
        }
        if self.open_shell {
            waiter.open_shell(&post).await?;
        }
        Ok(())
    }

    async fn drive_unlock(
        &mut self,
        attempt: &mut UnlockAttempt,
        detected: Option<ServerDetails>,
    ) -> UnlockResult<()> {
        let timeouts = self.profile.timeouts;
        let pre_server = self.run_pre_boot(attempt, detected).await?;

        attempt.enter(RebootPhase::PostBootPhase);
        let post = self.profile.post_boot_target();
        let waiter = self.post_boot_waiter();
        let arrival = waiter.wait(&post, timeouts.boot_timeout).await?;
        self.record_host_keys(&pre_server, arrival.server).await;
        if self.open_shell {
            waiter.open_shell(&post).await?;
        }
        Ok(())
    }

    fn post_boot_waiter(&self) -> PostBootWaiter {
        let waiter = PostBootWaiter::new(self.backend.shell.clone(), &self.profile.timeouts);
        match &self.identifier {
            Some(identifier) => waiter.identifying(identifier),
            None => waiter,
        }
    }

    /// Waits for (unless `detected`) and unlocks the pre-boot environment.
    async fn run_pre_boot(
        &mut self,
        attempt: &mut UnlockAttempt,
        detected: Option<ServerDetails>,
    ) -> UnlockResult<ServerDetails> {
        attempt.enter(RebootPhase::PreBootPhase);
        let server = match detected {
            Some(server) => server,
            None => self.wait_for_pre_boot().await?.ok_or_else(|| {
                UnlockError::timeout(
                    format!("pre-boot environment of {} to become available", self.profile.alias),
                    self.profile.timeouts.connect_timeout,
                )
            })?,
        };
        if let Some(identifier) = self.identifier.as_mut() {
            if identifier.classify(&server) == Environment::PreBoot {
                identifier.remember_pre_boot(&server);
            }
        }

        let unlocker = PreBootUnlocker::new(&self.backend, self.interaction);
        let method = unlocker.unlock(&self.profile).await?;
        debug!(?method, "root disk unlocked");
        Ok(server)
    }

    // ==========================================================================
    // 3. Finding the pre-boot environment
    // ==========================================================================

    /// Waits up to `connect-timeout` for the pre-boot environment and returns
    /// its scan. `Ok(None)` means it never showed up.
    ///
    /// With distinct ports a successful login on the pre-boot port is enough.
    /// Otherwise only a scan that identifies the pre-boot server counts, so a
    /// booted system answering on the same address is never mistaken for it.
    pub async fn wait_for_pre_boot(&self) -> UnlockResult<Option<ServerDetails>> {
        let timeouts = self.profile.timeouts;
        let target = self.profile.pre_boot()?.target();
        let identifier = self.identifier.as_ref().ok_or_else(|| {
            UnlockError::Configuration(format!(
                "no pre-boot configuration available for {}",
                self.profile.alias
            ))
        })?;
        info!(endpoint = %target, method = ?identifier.method(), "waiting for pre-boot environment");

        if !identifier.needs_scan() {
            let probe = ConnectionProbe::new(self.backend.shell.clone(), &timeouts);
            match probe.probe(&target, timeouts.connect_timeout).await {
                Reachability::Reachable => {}
                Reachability::Unreachable => return Ok(None),
                Reachability::Error(reason) => {
                    return Err(UnlockError::Connection(format!("{target}: {reason}")));
                }
            }
            let server = identifier.scan_pre_boot().await;
            match identifier.classify(&server) {
                Environment::PreBoot => {
                    info!(header = %server.header, "detected pre-boot environment (as expected)")
                }
                Environment::PostBoot => self.accept_unexpected_server(&server).await?,
                _ => debug!("ssh-keyscan could not identify the pre-boot server"),
            }
            return Ok(Some(server));
        }

        let started = Instant::now();
        let mut warned = false;
        loop {
            let server = identifier.scan_pre_boot().await;
            match identifier.classify(&server) {
                Environment::PreBoot => {
                    info!(header = %server.header, "detected pre-boot environment");
                    return Ok(Some(server));
                }
                Environment::PostBoot
                    if !identifier.shares_endpoint() && !identifier.knows_pre_boot_keys() =>
                {
                    self.accept_unexpected_server(&server).await?;
                    return Ok(Some(server));
                }
                Environment::PostBoot if !warned => {
                    warn!(header = %server.header, "detected post-boot environment while waiting for the pre-boot environment, will keep retrying");
                    warned = true;
                }
                environment => trace!(?environment, "no pre-boot environment yet"),
            }
            if started.elapsed() + timeouts.retry_interval > timeouts.connect_timeout {
                return Ok(None);
            }
            sleep(timeouts.retry_interval).await;
        }
    }

    /// OpenSSH answered where the initramfs was expected. Operators get to
    /// decide, unattended runs carry on with a warning.
    async fn accept_unexpected_server(&self, server: &ServerDetails) -> UnlockResult<()> {
        warn!(
            header = %server.header,
            "detected OpenSSH on the pre-boot endpoint where Dropbear was expected, \
             could this be the post-boot environment?"
        );
        if self.interaction == Interaction::Interactive {
            if !self.backend.console.confirm("Continue connecting anyway?").await? {
                return Err(UnlockError::Aborted(
                    "unlock sequence aborted by operator".to_string(),
                ));
            }
            info!("continuing unlock sequence with operator consent");
        }
        Ok(())
    }

    /// Stores the host keys of both environments when they are known to
    /// differ and are not what the configuration already says.
    async fn record_host_keys(&mut self, pre_server: &ServerDetails, post_server: Option<ServerDetails>) {
        let (Some(store), Some(identifier)) = (&self.host_key_store, self.identifier.as_mut()) else {
            return;
        };
        let post_server = match post_server {
            Some(server) => server,
            None => identifier.scan_post_boot().await,
        };
        if pre_server.host_keys.is_empty()
            || post_server.host_keys.is_empty()
            || pre_server.host_keys == post_server.host_keys
        {
            debug!(host = %self.profile.alias, "host keys of the two environments are not distinguishable, not storing them");
            return;
        }
        identifier.remember_post_boot(&post_server);

        let Some(settings) = self.profile.pre_boot.as_mut() else {
            return;
        };
        if settings.host_keys.pre_boot == pre_server.host_keys
            && settings.host_keys.post_boot == post_server.host_keys
        {
            return;
        }
        match store.store(&self.profile.alias, &pre_server.host_keys, &post_server.host_keys) {
            Ok(()) => {
                settings.host_keys.pre_boot = pre_server.host_keys.clone();
                settings.host_keys.post_boot = post_server.host_keys;
            }
            Err(e) => warn!(host = %self.profile.alias, error = %e, "failed to store SSH host keys"),
        }
    }

    fn finish(
        &mut self,
        mut attempt: UnlockAttempt,
        result: UnlockResult<()>,
    ) -> UnlockResult<UnlockAttempt> {
        attempt.finished_at = Some(Utc::now());
        let outcome = match result {
            Ok(()) => {
                attempt.enter(RebootPhase::Verified);
                attempt.outcome = AttemptOutcome::Verified;
                Ok(attempt.clone())
            }
            Err(e) => {
                warn!(host = %attempt.alias, error = %e, "attempt failed");
                attempt.enter(RebootPhase::Failed);
                attempt.outcome = AttemptOutcome::Failed(e.to_string());
                Err(e)
            }
        };
        self.last_attempt = Some(attempt);
        outcome
    }

    // ==========================================================================
    // 4. Remote inspection of the running host
    // ==========================================================================

    /// Refuses to reboot a host with an encrypted root disk and no way to unlock it.
    async fn ensure_unlockable(&self, post: &SshTarget) -> UnlockResult<()> {
        let encrypted = self.root_is_encrypted(post).await?;
        if encrypted && !self.profile.has_encryption() {
            return Err(UnlockError::Configuration(format!(
                "{} appears to use root disk encryption but there is no unlock configuration \
                 for it, refusing to reboot a system we would not be able to unlock",
                self.profile.alias
            )));
        }
        info!(host = %self.profile.alias, encrypted, "checked root disk encryption");
        Ok(())
    }

    async fn root_is_encrypted(&self, post: &SshTarget) -> UnlockResult<bool> {
        let crypttab = self.run(post, ["cat", "/etc/crypttab"]).await?;
        if !crypttab.success() {
            debug!("no /etc/crypttab on the remote system");
            return Ok(false);
        }

        for entry in parse_crypttab(&crypttab.stdout) {
            if entry.is_volatile() {
                debug!(target = %entry.target, "skipping volatile crypttab entry");
                continue;
            }
            let device = match entry.source_device() {
                SourceDevice::Block(device) => device,
                SourceDevice::File(path) => {
                    debug!(target = %entry.target, %path, "skipping file-backed crypttab entry");
                    continue;
                }
            };
            debug!(%device, "checking whether the device holds the root filesystem");
            let listing = self.run(post, ["lsblk".to_string(), device]).await?;
            if listing.success() && lsblk_shows_root(&listing.stdout) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn uptime(&self, post: &SshTarget) -> UnlockResult<Duration> {
        let output = self.run(post, ["cat", "/proc/uptime"]).await?;
        output
            .stdout
            .split_whitespace()
            .next()
            .and_then(|seconds| seconds.parse::<f64>().ok())
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| {
                UnlockError::Connection(format!("unexpected /proc/uptime contents on {post}"))
            })
    }

    async fn issue_reboot(&self, post: &SshTarget) -> UnlockResult<()> {
        let argv: Vec<&str> = if post.endpoint.user == "root" {
            vec!["reboot"]
        } else {
            vec!["sudo", "-n", "reboot"]
        };
        match self
            .backend
            .shell
            .execute(post, RemoteCommand::new(argv, INSPECTION_BUDGET))
            .await
        {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(UnlockError::Connection(format!(
                "reboot command failed on {post} with status {}: {}",
                output.status,
                output.stderr.trim()
            ))),
            Err(e) if e.is_transient() => {
                info!(error = %e, "connection dropped while issuing reboot, assuming the SSH server shut down");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `/proc/uptime` going down is the proof that the host really restarted.
    async fn wait_for_lower_uptime(
        &self,
        post: &SshTarget,
        old_uptime: Duration,
        budget: Duration,
    ) -> UnlockResult<()> {
        let interval = self.profile.timeouts.retry_interval;
        let started = Instant::now();
        loop {
            match self.uptime(post).await {
                Ok(uptime) if uptime < old_uptime => return Ok(()),
                Ok(uptime) => debug!(?uptime, "uptime has not reset yet"),
                Err(e) => debug!(error = %e, "uptime check failed"),
            }
            if started.elapsed() + interval > budget {
                return Err(UnlockError::timeout(
                    format!("{post} to report a lower uptime after the reboot"),
                    self.profile.timeouts.boot_timeout,
                ));
            }
            sleep(interval).await;
        }
    }

    async fn run<I, S>(&self, target: &SshTarget, argv: I) -> Result<CommandOutput, ShellError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backend
            .shell
            .execute(target, RemoteCommand::new(argv, INSPECTION_BUDGET))
            .await
    }
}

fn whole_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}
