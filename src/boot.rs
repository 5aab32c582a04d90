// src/boot.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::config::{SshTarget, Timeouts};
use crate::error::{UnlockError, UnlockResult};
use crate::identify::{Environment, ServerIdentifier};
use crate::probe::{ConnectionProbe, Reachability};
use crate::sys::keyscan::ServerDetails;
use crate::sys::traits::RemoteShell;

/// How the booted system was found.
#[derive(Debug, Clone)]
pub struct PostBootArrival {
    pub waited: Duration,
    /// The last scan of the post-boot endpoint, when scans were needed.
    pub server: Option<ServerDetails>,
}

/// Waits for the booted system to accept SSH logins again.
pub struct PostBootWaiter {
    shell: Arc<dyn RemoteShell>,
    probe: ConnectionProbe,
    identifier: Option<ServerIdentifier>,
}

impl PostBootWaiter {
    pub fn new(shell: Arc<dyn RemoteShell>, timeouts: &Timeouts) -> Self {
        Self {
            probe: ConnectionProbe::new(shell.clone(), timeouts),
            shell,
            identifier: None,
        }
    }

    /// Only counts answers that the identifier attributes to the booted
    /// system. Without this a lingering Dropbear on a shared address looks
    /// exactly like a finished boot.
    pub fn identifying(mut self, identifier: &ServerIdentifier) -> Self {
        if identifier.needs_scan() {
            self.identifier = Some(identifier.clone());
        }
        self
    }

    /// Polls `target` until two probes one interval apart both succeed.
    ///
    /// Refusals are not fatal here: a system that is still starting rejects
    /// logins (pam_nologin) before it accepts them.
    pub async fn wait(
        &self,
        target: &SshTarget,
        boot_timeout: Duration,
    ) -> UnlockResult<PostBootArrival> {
        let interval = self.probe.retry_interval();
        let started = Instant::now();
        let mut last_refusal: Option<String> = None;
        info!(endpoint = %target, scans = self.identifier.is_some(), "waiting for post-boot environment");

        loop {
            match self.look(target).await.0 {
                Reachability::Reachable => {
                    sleep(interval).await;
                    match self.look(target).await {
                        (Reachability::Reachable, server) => {
                            let waited = started.elapsed();
                            info!(endpoint = %target, ?waited, "post-boot environment is online");
                            return Ok(PostBootArrival { waited, server });
                        }
                        (Reachability::Unreachable, _) => {
                            debug!(endpoint = %target, "first answer was not confirmed, still waiting")
                        }
                        (Reachability::Error(reason), _) => last_refusal = Some(reason),
                    }
                }
                Reachability::Error(reason) => last_refusal = Some(reason),
                Reachability::Unreachable => {}
            }

            if started.elapsed() + interval > boot_timeout {
                let mut what = format!("post-boot environment of {target} to come online");
                if let Some(reason) = last_refusal {
                    what.push_str(&format!(" (last refusal: {reason})"));
                }
                return Err(UnlockError::timeout(what, boot_timeout));
            }
            sleep(interval).await;
        }
    }

    /// One look at `target`. With an identifier the login is only attempted
    /// once a scan shows the booted system's server.
    async fn look(&self, target: &SshTarget) -> (Reachability, Option<ServerDetails>) {
        let Some(identifier) = &self.identifier else {
            return (self.probe.probe_once(target).await, None);
        };
        let server = identifier.scan_post_boot().await;
        match identifier.classify(&server) {
            Environment::PostBoot => (self.probe.probe_once(target).await, Some(server)),
            environment => {
                debug!(endpoint = %target, ?environment, header = %server.header, "not the booted system yet");
                (Reachability::Unreachable, Some(server))
            }
        }
    }

    /// Hands the terminal to a login shell on the booted system.
    pub async fn open_shell(&self, target: &SshTarget) -> UnlockResult<()> {
        info!(endpoint = %target, "starting interactive shell");
        self.shell.interactive_shell(target).await?;
        Ok(())
    }
}
