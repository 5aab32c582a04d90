// src/watch.rs

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HostProfile;
use crate::error::{UnlockError, UnlockResult};
use crate::identify::Environment;
use crate::loader::HostKeyStore;
use crate::probe::{ConnectionProbe, Reachability};
use crate::reboot::{RebootCoordinator, UnlockAttempt};
use crate::sys::Backend;
use crate::sys::keyscan::ServerDetails;
use crate::sys::secrets::Interaction;

/// Upper bound for the delay between failed cycles of one host.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

const EVENT_BUFFER: usize = 256;

/// Returns `true` if shutdown was requested before `duration` elapsed.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// `retry_interval * 2^(failures - 1)`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(retry_interval: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    retry_interval
        .saturating_mul(1u32 << exponent)
        .min(MAX_BACKOFF)
}

// ==============================================================================
// 1. Per-host state & events
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Polling the post-boot endpoint and counting misses.
    Baseline,
    /// Sustained misses seen; polling the pre-boot endpoint.
    AwaitingPreBoot,
    /// Passphrase injection followed by the post-boot wait.
    Unlocking,
    Backoff,
}

/// Mutable bookkeeping owned by exactly one monitor task.
#[derive(Debug, Clone)]
pub struct MonitorSession {
    pub alias: String,
    pub phase: MonitorPhase,
    pub last_transition: Instant,
    pub consecutive_unreachable: u32,
    pub consecutive_failures: u32,
    pub unlocks_completed: u64,
}

impl MonitorSession {
    fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            phase: MonitorPhase::Baseline,
            last_transition: Instant::now(),
            consecutive_unreachable: 0,
            consecutive_failures: 0,
            unlocks_completed: 0,
        }
    }

    fn transition(&mut self, phase: MonitorPhase) -> bool {
        if self.phase == phase {
            return false;
        }
        debug!(host = %self.alias, from = ?self.phase, to = ?phase, held = ?self.last_transition.elapsed(), "monitor phase change");
        self.phase = phase;
        self.last_transition = Instant::now();
        true
    }
}

/// Status reports from monitors to the supervisor.
#[derive(Debug)]
pub enum MonitorEvent {
    PhaseChanged { alias: String, phase: MonitorPhase },
    RebootDetected { alias: String, misses: u32 },
    PreBootTimedOut { alias: String, after: Duration },
    AttemptFinished { alias: String, attempt: UnlockAttempt },
    Failed { alias: String, error: String, retry_in: Duration },
    Restarted { alias: String },
}

// ==============================================================================
// 2. HostMonitor (one per host, one task each)
// ==============================================================================

/// What one baseline poll of the post-boot endpoint saw.
enum Sighting {
    PostBoot,
    /// The initramfs answered on a shared address: the reboot already happened.
    PreBoot(ServerDetails),
    Nothing,
}

pub struct HostMonitor {
    profile: HostProfile,
    backend: Backend,
    coordinator: RebootCoordinator,
    session: MonitorSession,
    events: mpsc::Sender<MonitorEvent>,
}

impl HostMonitor {
    pub fn new(
        profile: HostProfile,
        backend: Backend,
        host_keys: Option<HostKeyStore>,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        // 🛡️ Nobody is at a terminal for a watched host.
        let mut coordinator =
            RebootCoordinator::new(profile.clone(), backend.clone(), Interaction::Unattended);
        if let Some(store) = host_keys {
            coordinator = coordinator.with_host_key_store(store);
        }
        Self {
            session: MonitorSession::new(&profile.alias),
            profile,
            backend,
            coordinator,
            events,
        }
    }

    /// Loops until `shutdown` fires. Errors never escape: they are reported
    /// and followed by an exponential backoff.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(host = %self.profile.alias, "watching for reboots");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.cycle() => match result {
                    Ok(()) => self.session.consecutive_failures = 0,
                    Err(err) => {
                        self.session.consecutive_failures += 1;
                        let delay = backoff_delay(
                            self.profile.timeouts.retry_interval,
                            self.session.consecutive_failures,
                        );
                        self.set_phase(MonitorPhase::Backoff);
                        self.emit(MonitorEvent::Failed {
                            alias: self.profile.alias.clone(),
                            error: err.to_string(),
                            retry_in: delay,
                        });
                        if sleep_with_shutdown(delay, &shutdown).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!(host = %self.profile.alias, "monitor stopped");
    }

    /// One pass through baseline, reboot detection, unlock and post-boot wait.
    async fn cycle(&mut self) -> UnlockResult<()> {
        let timeouts = self.profile.timeouts;
        let threshold = timeouts.unreachable_threshold.max(1);

        // 1. Baseline: only a sustained run of misses counts as a reboot.
        self.set_phase(MonitorPhase::Baseline);
        self.session.consecutive_unreachable = 0;
        let detected = loop {
            match self.look_at_post_boot().await? {
                Sighting::PostBoot => {
                    if self.session.consecutive_unreachable > 0 {
                        debug!(
                            host = %self.profile.alias,
                            misses = self.session.consecutive_unreachable,
                            "post-boot environment answered again"
                        );
                    }
                    self.session.consecutive_unreachable = 0;
                }
                Sighting::PreBoot(server) => {
                    info!(host = %self.profile.alias, header = %server.header, "pre-boot environment is answering on the post-boot address");
                    break Some(server);
                }
                Sighting::Nothing => {
                    self.session.consecutive_unreachable += 1;
                    if self.session.consecutive_unreachable >= threshold {
                        break None;
                    }
                }
            }
            sleep(timeouts.retry_interval).await;
        };
        self.emit(MonitorEvent::RebootDetected {
            alias: self.profile.alias.clone(),
            misses: self.session.consecutive_unreachable,
        });

        // 2. Wait for the initramfs. Silence here may just mean the host is down.
        let server = match detected {
            Some(server) => server,
            None => {
                self.set_phase(MonitorPhase::AwaitingPreBoot);
                match self.coordinator.wait_for_pre_boot().await? {
                    Some(server) => server,
                    None => {
                        warn!(host = %self.profile.alias, "pre-boot environment did not show up, resuming post-boot polling");
                        self.emit(MonitorEvent::PreBootTimedOut {
                            alias: self.profile.alias.clone(),
                            after: timeouts.connect_timeout,
                        });
                        return Ok(());
                    }
                }
            }
        };

        // 3 & 4. Unlock, then wait for the booted system.
        self.set_phase(MonitorPhase::Unlocking);
        let attempt = self.coordinator.unlock_detected(server).await?;
        self.session.unlocks_completed += 1;
        info!(
            host = %self.profile.alias,
            unlocks = self.session.unlocks_completed,
            "unlocked and verified"
        );
        self.emit(MonitorEvent::AttemptFinished {
            alias: self.profile.alias.clone(),
            attempt,
        });
        Ok(())
    }

    /// A login proves the booted system is up only when the two environments
    /// listen on different ports. Otherwise the server has to be identified.
    async fn look_at_post_boot(&self) -> UnlockResult<Sighting> {
        if let Some(identifier) = self.coordinator.identifier().filter(|id| id.needs_scan()) {
            let server = identifier.scan_post_boot().await;
            return Ok(match identifier.classify(&server) {
                Environment::PostBoot => Sighting::PostBoot,
                Environment::PreBoot => Sighting::PreBoot(server),
                Environment::Unknown | Environment::Silent => Sighting::Nothing,
            });
        }

        let post_boot = self.profile.post_boot_target();
        let probe = ConnectionProbe::new(self.backend.shell.clone(), &self.profile.timeouts);
        match probe.probe_once(&post_boot).await {
            Reachability::Reachable => Ok(Sighting::PostBoot),
            Reachability::Unreachable => Ok(Sighting::Nothing),
            Reachability::Error(reason) => {
                Err(UnlockError::Connection(format!("{post_boot}: {reason}")))
            }
        }
    }

    fn set_phase(&mut self, phase: MonitorPhase) {
        if self.session.transition(phase) {
            self.emit(MonitorEvent::PhaseChanged {
                alias: self.profile.alias.clone(),
                phase,
            });
        }
    }

    /// A slow supervisor must never stall a monitor, so events are dropped when the channel is full.
    fn emit(&self, event: MonitorEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(host = %self.profile.alias, error = %e, "dropping monitor event");
        }
    }
}

// ==============================================================================
// 3. WatchScheduler (supervisor)
// ==============================================================================

pub struct WatchScheduler {
    profiles: Vec<HostProfile>,
    backend: Backend,
    host_keys: Option<HostKeyStore>,
    shutdown: CancellationToken,
}

impl WatchScheduler {
    pub fn new(
        profiles: Vec<HostProfile>,
        backend: Backend,
        shutdown: CancellationToken,
    ) -> UnlockResult<Self> {
        if profiles.is_empty() {
            return Err(UnlockError::Configuration(
                "no hosts to watch (is the configuration empty?)".to_string(),
            ));
        }
        if let Some(profile) = profiles.iter().find(|p| !p.has_encryption()) {
            return Err(UnlockError::Configuration(format!(
                "{} has no pre-boot configuration, there is nothing to unlock",
                profile.alias
            )));
        }
        Ok(Self {
            profiles,
            backend,
            host_keys: None,
            shutdown,
        })
    }

    /// Host keys seen by any monitor are persisted here.
    pub fn with_host_key_store(mut self, store: HostKeyStore) -> Self {
        self.host_keys = Some(store);
        self
    }

    /// Starts one guarded monitor task per host.
    pub fn spawn(self) -> (JoinSet<()>, mpsc::Receiver<MonitorEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let mut guardians = JoinSet::new();
        for profile in self.profiles {
            guardians.spawn(guard(
                profile,
                self.backend.clone(),
                self.host_keys.clone(),
                events.clone(),
                self.shutdown.clone(),
            ));
        }
        (guardians, receiver)
    }

    /// Runs every monitor and logs their events until shutdown.
    pub async fn run(self) {
        info!(hosts = self.profiles.len(), "starting watch mode");
        let (mut guardians, mut events) = self.spawn();
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
        while guardians.join_next().await.is_some() {}
        info!("watch mode stopped");
    }
}

/// Keeps one host's monitor alive, respawning it if it panics.
async fn guard(
    profile: HostProfile,
    backend: Backend,
    host_keys: Option<HostKeyStore>,
    events: mpsc::Sender<MonitorEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let monitor = HostMonitor::new(
            profile.clone(),
            backend.clone(),
            host_keys.clone(),
            events.clone(),
        );
        match tokio::spawn(monitor.run(shutdown.clone())).await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                error!(host = %profile.alias, "monitor panicked, restarting it");
                let _ = events.try_send(MonitorEvent::Restarted {
                    alias: profile.alias.clone(),
                });
                if sleep_with_shutdown(profile.timeouts.retry_interval, &shutdown).await {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::PhaseChanged { alias, phase } => debug!(host = %alias, ?phase, "phase changed"),
        MonitorEvent::RebootDetected { alias, misses } => {
            info!(host = %alias, misses, "post-boot environment went away, expecting pre-boot environment")
        }
        MonitorEvent::PreBootTimedOut { alias, after } => {
            warn!(host = %alias, after = %humantime::format_duration(*after), "no pre-boot environment appeared")
        }
        MonitorEvent::AttemptFinished { alias, attempt } => {
            info!(host = %alias, phases = attempt.phases.len(), "unlock attempt verified")
        }
        MonitorEvent::Failed { alias, error, retry_in } => {
            warn!(host = %alias, %error, retry_in = ?retry_in, "monitor cycle failed")
        }
        MonitorEvent::Restarted { alias } => warn!(host = %alias, "monitor restarted"),
    }
}
