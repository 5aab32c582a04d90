// src/testing.rs
//
// In-memory stand-ins for the network and the password store. Every host is a
// small state machine driven by tokio's clock, so tests run under
// `start_paused = true` and finish instantly.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{DEFAULT_CRYPTROOT_PROGRAM, Endpoint, SshTarget};
use crate::sys::keyscan::ServerDetails;
use crate::sys::secrets::Passphrase;
use crate::sys::traits::{
    CommandOutput, Console, RemoteCommand, RemoteShell, SecretStore, ShellError,
};
use crate::unlock::{PIPE_MISSING_STATUS, WRITE_FILE_SCRIPT, WRITE_PIPE_SCRIPT};

const INITIAL_UPTIME: Duration = Duration::from_secs(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostPhase {
    /// Post-boot environment answering.
    Running,
    /// Rebooting. Nothing answers until `until`.
    Offline { until: Instant },
    /// Initramfs waiting for the passphrase.
    PreBoot,
    /// Root disk unlocked, post-boot system still starting. Dropbear keeps
    /// answering until `pre_boot_until`.
    Booting {
        until: Instant,
        pre_boot_until: Instant,
    },
}

/// One simulated machine with a post-boot and (optionally) a pre-boot SSH server.
pub struct FakeHost {
    pre_boot: Option<Endpoint>,
    post_boot: Endpoint,
    phase: HostPhase,
    pipe_ready: bool,
    has_pipe: bool,
    denies_logins: bool,
    flaky_writes: usize,
    offline_for: Duration,
    boots_in: Duration,
    lingers_for: Duration,
    scheduled_reboots: Vec<Duration>,
    booted_at: Instant,
    uptime_base: Duration,
    files: HashMap<String, String>,
    processes: String,
}

impl FakeHost {
    pub fn new(post_boot: Endpoint) -> Self {
        Self {
            pre_boot: None,
            post_boot,
            phase: HostPhase::Running,
            pipe_ready: false,
            has_pipe: true,
            denies_logins: false,
            flaky_writes: 0,
            offline_for: Duration::from_secs(20),
            boots_in: Duration::from_secs(20),
            lingers_for: Duration::ZERO,
            scheduled_reboots: Vec::new(),
            booted_at: Instant::now(),
            uptime_base: INITIAL_UPTIME,
            files: HashMap::new(),
            processes: String::new(),
        }
    }

    /// Root disk encryption with Dropbear listening on `pre_boot`.
    pub fn encrypted(mut self, pre_boot: Endpoint) -> Self {
        self.pre_boot = Some(pre_boot);
        self
    }

    /// Starts stuck at the passphrase prompt instead of running.
    pub fn in_pre_boot(mut self) -> Self {
        self.phase = HostPhase::PreBoot;
        self.pipe_ready = self.has_pipe;
        self
    }

    /// The initramfs has no passphrase FIFO (older cryptsetup).
    pub fn without_pipe(mut self) -> Self {
        self.has_pipe = false;
        self.pipe_ready = false;
        self
    }

    /// The post-boot server answers but rejects every login.
    pub fn denying_logins(mut self) -> Self {
        self.denies_logins = true;
        self
    }

    /// The first `count` passphrase writes drop the connection.
    pub fn flaky_writes(mut self, count: usize) -> Self {
        self.flaky_writes = count;
        self
    }

    /// How long nothing answers after a reboot starts.
    pub fn offline_for(mut self, duration: Duration) -> Self {
        self.offline_for = duration;
        self
    }

    /// How long the booted system takes to answer after the disk is unlocked.
    pub fn boots_in(mut self, duration: Duration) -> Self {
        self.boots_in = duration;
        self
    }

    /// How long Dropbear keeps answering after the passphrase was consumed.
    pub fn lingers_for(mut self, duration: Duration) -> Self {
        self.lingers_for = duration;
        self
    }

    /// Reboots on its own `offset` after the network was created. Offsets
    /// must be added in ascending order.
    pub fn reboots_at(mut self, offset: Duration) -> Self {
        self.scheduled_reboots.push(offset);
        self
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    pub fn with_processes(mut self, listing: &str) -> Self {
        self.processes = listing.to_string();
        self
    }

    fn settle(&mut self, start: Instant, now: Instant) {
        loop {
            match self.phase {
                HostPhase::Running => match self.scheduled_reboots.first() {
                    Some(offset) if now >= start + *offset => {
                        let at = start + *offset;
                        self.scheduled_reboots.remove(0);
                        self.phase = HostPhase::Offline {
                            until: at + self.offline_for,
                        };
                    }
                    _ => break,
                },
                HostPhase::Offline { until } if now >= until => {
                    if self.pre_boot.is_some() {
                        self.phase = HostPhase::PreBoot;
                        self.pipe_ready = self.has_pipe;
                    } else {
                        self.start_running(until);
                    }
                }
                HostPhase::Booting { until, .. } if now >= until => self.start_running(until),
                _ => break,
            }
        }
    }

    fn start_running(&mut self, since: Instant) {
        self.phase = HostPhase::Running;
        self.booted_at = since;
        self.uptime_base = Duration::ZERO;
    }

    fn reboot(&mut self, now: Instant) {
        self.phase = HostPhase::Offline {
            until: now + self.offline_for,
        };
    }

    fn begin_booting(&mut self, now: Instant) {
        self.pipe_ready = false;
        self.phase = HostPhase::Booting {
            until: now + self.boots_in,
            pre_boot_until: now + self.lingers_for,
        };
    }

    fn uptime(&self, now: Instant) -> Duration {
        self.uptime_base + now.duration_since(self.booted_at)
    }
}

/// Which of a host's environments an endpoint reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Environment {
    PreBoot,
    PostBoot,
}

/// What the fake decided, applied after the state lock is released.
enum Step {
    Now(Result<CommandOutput, ShellError>),
    After(Duration, Result<CommandOutput, ShellError>),
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub at: Duration,
    pub endpoint: Endpoint,
    pub argv: Vec<String>,
}

#[derive(Default)]
struct NetworkState {
    hosts: Vec<FakeHost>,
    commands: Vec<Recorded>,
    unlock_writes: Vec<(Duration, Vec<u8>)>,
    file_writes: Vec<(String, Vec<u8>)>,
    scans: Vec<(Duration, Endpoint)>,
    terminal_runs: Vec<Vec<String>>,
    sessions: usize,
}

pub struct FakeNetwork {
    start: Instant,
    state: Mutex<NetworkState>,
}

impl FakeNetwork {
    pub fn new(hosts: Vec<FakeHost>) -> Self {
        Self {
            start: Instant::now(),
            state: Mutex::new(NetworkState {
                hosts,
                ..NetworkState::default()
            }),
        }
    }

    /// Offsets of every `test -e /` sent to `endpoint`.
    pub fn probes(&self, endpoint: &Endpoint) -> Vec<Duration> {
        self.commands_to(endpoint)
            .into_iter()
            .filter(|recorded| recorded.argv == ["test", "-e", "/"])
            .map(|recorded| recorded.at)
            .collect()
    }

    pub fn commands_to(&self, endpoint: &Endpoint) -> Vec<Recorded> {
        let state = self.state.lock().unwrap();
        state
            .commands
            .iter()
            .filter(|recorded| &recorded.endpoint == endpoint)
            .cloned()
            .collect()
    }

    /// Passphrases written into a named pipe, with their offsets.
    pub fn unlock_writes(&self) -> Vec<(Duration, Vec<u8>)> {
        self.state.lock().unwrap().unlock_writes.clone()
    }

    pub fn file_writes(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().file_writes.clone()
    }

    /// Offsets of every ssh-keyscan of `endpoint`.
    pub fn scans(&self, endpoint: &Endpoint) -> Vec<Duration> {
        let state = self.state.lock().unwrap();
        state
            .scans
            .iter()
            .filter(|(_, scanned)| scanned == endpoint)
            .map(|(at, _)| *at)
            .collect()
    }

    /// Commands run with the operator's terminal attached.
    pub fn terminal_runs(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().terminal_runs.clone()
    }

    pub fn interactive_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().duration_since(self.start)
    }

    fn dispatch(&self, target: &SshTarget, command: &RemoteCommand) -> Step {
        let now = Instant::now();
        let label = target.to_string();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.commands.push(Recorded {
            at: now.duration_since(self.start),
            endpoint: target.endpoint.clone(),
            argv: command.argv.clone(),
        });

        let start = self.start;
        let Some((index, environment)) = locate(&mut state.hosts, start, now, &target.endpoint)
        else {
            return Step::Now(Err(not_listening(&label)));
        };

        let host = &mut state.hosts[index];
        if environment == Environment::PostBoot && host.denies_logins {
            return Step::Now(Err(ShellError::Refused {
                target: label,
                detail: "Permission denied (publickey).".to_string(),
            }));
        }

        let argv: Vec<&str> = command.argv.iter().map(String::as_str).collect();
        let argv = match argv.as_slice() {
            ["sudo", "-n", rest @ ..] => rest.to_vec(),
            _ => argv,
        };
        let stdin = command.stdin.as_ref().map(|payload| payload.to_vec());

        match argv.as_slice() {
            ["test", "-e", "/"] => Step::Now(Ok(status(0))),
            ["test", "-f", path] => Step::Now(Ok(status(
                if host.files.contains_key(*path) { 0 } else { 1 },
            ))),
            ["cat", "/proc/uptime"] => {
                let uptime = host.uptime(now).as_secs_f64();
                Step::Now(Ok(stdout(&format!("{uptime:.2} {:.2}\n", uptime * 3.0))))
            }
            ["cat", path] => Step::Now(Ok(match host.files.get(*path) {
                Some(contents) => stdout(contents),
                None => CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: format!("cat: {path}: No such file or directory"),
                },
            })),
            ["lsblk", device] => {
                let mounted = host
                    .files
                    .get(&format!("lsblk:{device}"))
                    .cloned()
                    .unwrap_or_default();
                Step::Now(Ok(stdout(&mounted)))
            }
            ["ps"] => Step::Now(Ok(stdout(&host.processes))),
            ["kill", "-9", _] | ["chmod", ..] => Step::Now(Ok(status(0))),
            ["reboot"] => {
                host.reboot(now);
                Step::Now(Err(ShellError::NotListening {
                    target: label,
                    detail: "Connection closed by remote host".to_string(),
                }))
            }
            ["sh", "-c", script, "unlock", _pipe, _] if *script == WRITE_PIPE_SCRIPT
                && host.flaky_writes > 0 =>
            {
                host.flaky_writes -= 1;
                Step::Now(Err(ShellError::NotListening {
                    target: label,
                    detail: "Connection reset by peer".to_string(),
                }))
            }
            ["sh", "-c", script, "unlock", _pipe, seconds] if *script == WRITE_PIPE_SCRIPT => {
                if environment == Environment::PreBoot && host.pipe_ready {
                    host.begin_booting(now);
                    let at = now.duration_since(start);
                    state.unlock_writes.push((at, stdin.unwrap_or_default()));
                    Step::Now(Ok(status(0)))
                } else {
                    let waited = Duration::from_secs(seconds.parse().unwrap_or(0));
                    Step::After(waited, Ok(status(PIPE_MISSING_STATUS)))
                }
            }
            ["sh", "-c", script, "write", path] if *script == WRITE_FILE_SCRIPT => {
                let contents = stdin.unwrap_or_default();
                host.files.insert(
                    path.to_string(),
                    String::from_utf8_lossy(&contents).to_string(),
                );
                state.file_writes.push((path.to_string(), contents));
                Step::Now(Ok(status(0)))
            }
            [program] if *program == DEFAULT_CRYPTROOT_PROGRAM => {
                let configured = host.files.values().any(|c| c.contains(",keyscript="));
                if environment == Environment::PreBoot && configured {
                    host.begin_booting(now);
                    Step::Now(Ok(status(0)))
                } else {
                    Step::Now(Ok(status(1)))
                }
            }
            _ => Step::Now(Ok(CommandOutput {
                status: 127,
                stdout: String::new(),
                stderr: format!("{}: not found", command.program()),
            })),
        }
    }
}

/// Finds the host and environment answering on `endpoint` right now.
fn locate(
    hosts: &mut [FakeHost],
    start: Instant,
    now: Instant,
    endpoint: &Endpoint,
) -> Option<(usize, Environment)> {
    for (index, host) in hosts.iter_mut().enumerate() {
        host.settle(start, now);
        let dropbear_up = match host.phase {
            HostPhase::PreBoot => true,
            HostPhase::Booting { pre_boot_until, .. } => now < pre_boot_until,
            _ => false,
        };
        if dropbear_up && host.pre_boot.as_ref() == Some(endpoint) {
            return Some((index, Environment::PreBoot));
        }
        if host.phase == HostPhase::Running && &host.post_boot == endpoint {
            return Some((index, Environment::PostBoot));
        }
    }
    None
}

fn not_listening(label: &str) -> ShellError {
    ShellError::NotListening {
        target: label.to_string(),
        detail: "Connection refused".to_string(),
    }
}

fn status(code: i32) -> CommandOutput {
    CommandOutput {
        status: code,
        ..CommandOutput::default()
    }
}

fn stdout(text: &str) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: text.to_string(),
        stderr: String::new(),
    }
}

#[async_trait]
impl RemoteShell for FakeNetwork {
    async fn execute(
        &self,
        target: &SshTarget,
        command: RemoteCommand,
    ) -> Result<CommandOutput, ShellError> {
        match self.dispatch(target, &command) {
            Step::Now(result) => result,
            Step::After(delay, result) => {
                if delay > command.timeout {
                    tokio::time::sleep(command.timeout).await;
                    return Err(ShellError::TimedOut {
                        target: target.to_string(),
                        after: command.timeout,
                    });
                }
                tokio::time::sleep(delay).await;
                result
            }
        }
    }

    async fn scan(
        &self,
        endpoint: &Endpoint,
        _proxy: Option<&str>,
        _timeout: Duration,
    ) -> Result<ServerDetails, ShellError> {
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.scans.push((now.duration_since(self.start), endpoint.clone()));
        let (header, key) = match locate(&mut state.hosts, self.start, now, endpoint) {
            Some((_, Environment::PreBoot)) => ("SSH-2.0-dropbear_2020.81", "AAAAdropbear"),
            Some((_, Environment::PostBoot)) => ("SSH-2.0-OpenSSH_9.2p1", "AAAAopenssh"),
            None => return Ok(ServerDetails::default()),
        };
        Ok(ServerDetails {
            header: header.to_string(),
            host_keys: [format!("{key}-{}", endpoint.host)].into_iter().collect(),
        })
    }

    async fn interactive_shell(&self, _target: &SshTarget) -> Result<(), ShellError> {
        self.state.lock().unwrap().sessions += 1;
        Ok(())
    }

    async fn run_on_terminal(
        &self,
        target: &SshTarget,
        argv: Vec<String>,
    ) -> Result<i32, ShellError> {
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.terminal_runs.push(argv.clone());
        let Some((index, environment)) = locate(&mut state.hosts, self.start, now, &target.endpoint)
        else {
            return Err(not_listening(&target.to_string()));
        };
        let host = &mut state.hosts[index];
        // The operator types the passphrase into the restarted prompt.
        match argv.as_slice() {
            [program] if environment == Environment::PreBoot && host.files.contains_key(program) => {
                host.begin_booting(now);
                Ok(0)
            }
            _ => Ok(1),
        }
    }
}

// ==============================================================================
// Operator console
// ==============================================================================

/// Scripted operator: always types the same password and gives the same answer.
#[derive(Default)]
pub struct FakeConsole {
    password: String,
    consent: bool,
    password_prompts: AtomicUsize,
    questions: AtomicUsize,
}

impl FakeConsole {
    pub fn answering(password: &str, consent: bool) -> Self {
        Self {
            password: password.to_string(),
            consent,
            ..Self::default()
        }
    }

    pub fn password_prompts(&self) -> usize {
        self.password_prompts.load(Ordering::SeqCst)
    }

    pub fn questions(&self) -> usize {
        self.questions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Console for FakeConsole {
    async fn read_password(&self, _prompt: &str) -> io::Result<Passphrase> {
        self.password_prompts.fetch_add(1, Ordering::SeqCst);
        Ok(Passphrase::new(self.password.as_bytes().to_vec()))
    }

    async fn confirm(&self, _question: &str) -> io::Result<bool> {
        self.questions.fetch_add(1, Ordering::SeqCst);
        Ok(self.consent)
    }
}

// ==============================================================================
// Password store
// ==============================================================================

#[derive(Default)]
pub struct FakeSecretStore {
    entries: HashMap<String, String>,
    lookups: AtomicUsize,
}

impl FakeSecretStore {
    pub fn with_entry(name: &str, value: &str) -> Self {
        let mut store = Self::default();
        store.entries.insert(name.to_string(), value.to_string());
        store
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn lookup(&self, name: &str, _store_dir: Option<&Path>) -> Result<Passphrase, String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.entries
            .get(name)
            .map(|value| Passphrase::new(value.as_bytes().to_vec()))
            .ok_or_else(|| format!("{name} is not in the password store"))
    }
}
