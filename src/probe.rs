// src/probe.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::config::{SshTarget, Timeouts};
use crate::error::{UnlockError, UnlockResult};
use crate::sys::traits::{RemoteCommand, RemoteShell, ShellError};

/// What one look at an endpoint revealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    /// Nothing (or nothing useful) answered. Try again later.
    Unreachable,
    /// The server answered and refused us. Retrying will not help.
    Error(String),
}

/// Checks whether an SSH endpoint accepts a trivial command.
///
/// Pre-boot and post-boot endpoints are probed by exactly the same code; only
/// the target and the budget differ.
#[derive(Clone)]
pub struct ConnectionProbe {
    shell: Arc<dyn RemoteShell>,
    retry_interval: Duration,
    attempt_timeout: Duration,
}

impl ConnectionProbe {
    pub fn new(shell: Arc<dyn RemoteShell>, timeouts: &Timeouts) -> Self {
        Self {
            shell,
            retry_interval: timeouts.retry_interval,
            attempt_timeout: timeouts.scan_timeout,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// A single attempt, no retries.
    pub async fn probe_once(&self, target: &SshTarget) -> Reachability {
        let command = RemoteCommand::new(["test", "-e", "/"], self.attempt_timeout);
        match self.shell.execute(target, command).await {
            Ok(output) if output.success() => Reachability::Reachable,
            Ok(output) => {
                debug!(target = %target, status = output.status, "probe command failed remotely");
                Reachability::Unreachable
            }
            Err(e) if e.is_transient() => {
                trace!(target = %target, error = %e, "endpoint not answering yet");
                Reachability::Unreachable
            }
            Err(ShellError::Refused { detail, .. }) => Reachability::Error(detail),
            Err(e) => Reachability::Error(e.to_string()),
        }
    }

    /// Retries at the fixed interval until the endpoint answers, refuses,
    /// or `timeout` is spent. Returns the last observation.
    pub async fn probe(&self, target: &SshTarget, timeout: Duration) -> Reachability {
        let started = Instant::now();
        loop {
            let observed = self.probe_once(target).await;
            if observed != Reachability::Unreachable {
                return observed;
            }
            if started.elapsed() + self.retry_interval > timeout {
                return Reachability::Unreachable;
            }
            sleep(self.retry_interval).await;
        }
    }

    /// Waits until `target` stops answering, which proves an old session is gone.
    pub async fn wait_until_unreachable(
        &self,
        target: &SshTarget,
        timeout: Duration,
    ) -> UnlockResult<()> {
        let started = Instant::now();
        loop {
            if self.probe_once(target).await == Reachability::Unreachable {
                debug!(target = %target, waited = ?started.elapsed(), "endpoint went away");
                return Ok(());
            }
            if started.elapsed() + self.retry_interval > timeout {
                return Err(UnlockError::timeout(
                    format!("{target} to shut down (it kept answering)"),
                    timeout,
                ));
            }
            sleep(self.retry_interval).await;
        }
    }
}
