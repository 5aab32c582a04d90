// src/lib.rs
//
// Reboots remote hosts whose root disk is encrypted, unlocks them from their
// pre-boot SSH server and verifies that the booted system comes back.

pub mod boot;
pub mod config;
pub mod error;
pub mod identify;
pub mod loader;
pub mod logging;
pub mod probe;
pub mod reboot;
pub mod sys;
pub mod unlock;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

use std::process::ExitCode;
use tracing::error;

use crate::error::{UnlockError, UnlockResult};
use crate::loader::{ConfigLoader, HostKeyStore};
use crate::reboot::{RebootCoordinator, UnlockAttempt};
use crate::sys::Backend;
use crate::sys::secrets::Interaction;

/// Reboots `name` (a configured alias or an SSH destination) and waits for it
/// to be back, unlocking it on the way when it has a pre-boot configuration.
///
/// This is the entry point other tools (package upgrade hooks and the like)
/// use to bounce a host without knowing anything about its disk layout.
pub async fn perform_reboot_cycle(name: &str) -> UnlockResult<UnlockAttempt> {
    let loader = ConfigLoader::discover()?;
    run_reboot_cycle(&loader, Backend::system(), HostKeyStore::discover(), name, false).await
}

/// [`perform_reboot_cycle`] with an explicit configuration and backend.
/// Host keys are only stored for configured sections.
pub async fn run_reboot_cycle(
    loader: &ConfigLoader,
    backend: Backend,
    host_keys: Option<HostKeyStore>,
    name: &str,
    open_shell: bool,
) -> UnlockResult<UnlockAttempt> {
    let profile = loader.reboot_profile(name)?;
    let mut coordinator =
        RebootCoordinator::new(profile, backend, Interaction::detect()).with_shell(open_shell);
    if let Some(store) = host_keys.filter(|_| loader.has_section(name)) {
        coordinator = coordinator.with_host_key_store(store);
    }
    coordinator.reboot_cycle().await
}

/// Logs `e` and maps it to the exit status both binaries share: 1 for
/// configuration problems, 2 for failed unlocks, 3 for anything unexpected.
pub fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<UnlockError>() {
        Some(UnlockError::Configuration(_)) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
        Some(_) => {
            error!("aborting due to error: {e:#}");
            ExitCode::from(2)
        }
        None => {
            error!("aborting due to unexpected error: {e:#}");
            ExitCode::from(3)
        }
    }
}
