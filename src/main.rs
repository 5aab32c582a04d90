// src/main.rs

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use remote_unlock::config::{HostProfile, PasswordSource};
use remote_unlock::error::UnlockError;
use remote_unlock::exit_code_for;
use remote_unlock::loader::{ConfigLoader, HostKeyStore};
use remote_unlock::logging;
use remote_unlock::reboot::RebootCoordinator;
use remote_unlock::sys::Backend;
use remote_unlock::sys::secrets::Interaction;
use remote_unlock::watch::WatchScheduler;

/// Unlock the root disk encryption of a remote system over SSH.
///
/// PRE_BOOT is `[user@]host[:port]` of the SSH server in the initramfs, or
/// the name of a configuration section. POST_BOOT defaults to port 22 of the
/// same host, logged into with your local user name.
#[derive(Parser, Debug)]
#[command(name = "unlock-remote-system", version, about, long_about = None)]
struct Cli {
    /// Private key for connections to the pre-boot environment.
    #[arg(short, long, value_name = "KEY_FILE")]
    identity_file: Option<PathBuf>,

    /// Known hosts file for the pre-boot environment (host keys are not checked without it).
    #[arg(short = 'k', long = "known-hosts", value_name = "HOSTS_FILE")]
    known_hosts: Option<PathBuf>,

    /// Name of the disk encryption password in the `pass` password store.
    #[arg(short, long, value_name = "NAME")]
    password: Option<String>,

    /// Connect to the remote system through this SSH proxy.
    #[arg(short, long = "remote-host", value_name = "SSH_ALIAS")]
    remote_host: Option<String>,

    /// Start an interactive shell once the remote system has finished booting.
    #[arg(short, long)]
    shell: bool,

    /// Keep monitoring and unlock the system whenever it is rebooted.
    #[arg(short, long)]
    watch: bool,

    /// Monitor every configured system (requires --watch).
    #[arg(short, long, requires = "watch")]
    all: bool,

    /// Increase logging verbosity (can be repeated).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (can be repeated).
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,

    #[arg(value_name = "PRE_BOOT", required_unless_present = "all")]
    pre_boot: Option<String>,

    #[arg(value_name = "POST_BOOT")]
    post_boot: Option<String>,
}

impl Cli {
    fn verbosity(&self) -> i8 {
        (self.verbose.min(8) as i8) - (self.quiet.min(8) as i8)
    }

    /// Command line options win over the configuration section.
    fn apply_overrides(&self, profile: &mut HostProfile) -> Result<()> {
        let settings = profile
            .pre_boot
            .as_mut()
            .context("profile has no pre-boot settings")?;
        if let Some(path) = &self.identity_file {
            settings.identity_file = Some(path.clone());
        }
        if let Some(path) = &self.known_hosts {
            settings.known_hosts_file = Some(path.clone());
        }
        if let Some(proxy) = &self.remote_host {
            settings.ssh_proxy = Some(proxy.clone());
        }
        if let Some(name) = &self.password {
            settings.password = Some(PasswordSource::Store {
                name: name.clone(),
                store_dir: None,
            });
        }
        if settings.password.is_none() && !self.watch {
            settings.password = Some(PasswordSource::Prompt);
        }
        Ok(())
    }

    /// Every configured section, each with the command line overrides applied.
    fn all_profiles(&self, loader: &ConfigLoader) -> Result<Vec<HostProfile>> {
        if loader.sources().is_empty() {
            return Err(UnlockError::Configuration(
                "--all needs at least one configuration file, none were found".to_string(),
            )
            .into());
        }
        let mut profiles = loader.all_profiles()?;
        for profile in &mut profiles {
            self.apply_overrides(profile)?;
        }
        Ok(profiles)
    }
}

// ==============================================================================
// 1. Entry point & exit codes
// ==============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbosity()) {
        eprintln!("unlock-remote-system: {e}");
        return ExitCode::from(3);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the async runtime: {e}");
            return ExitCode::from(3);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => exit_code_for(&e),
    }
}

// ==============================================================================
// 2. Single host & watch mode
// ==============================================================================

async fn run(cli: Cli) -> Result<()> {
    let loader = ConfigLoader::discover()?;
    debug!(files = ?loader.sources(), "configuration loaded");
    let backend = Backend::system();

    if cli.watch && cli.all {
        let profiles = cli.all_profiles(&loader)?;
        return watch(profiles, backend).await;
    }

    let pre_boot = cli
        .pre_boot
        .as_deref()
        .ok_or_else(|| UnlockError::Configuration("missing PRE_BOOT argument".to_string()))?;
    let configured = cli.post_boot.is_none() && loader.has_section(pre_boot);
    let mut profile = loader.resolve(pre_boot, cli.post_boot.as_deref())?;
    cli.apply_overrides(&mut profile)?;

    if cli.watch {
        return watch(vec![profile], backend).await;
    }

    let alias = profile.alias.clone();
    let mut coordinator =
        RebootCoordinator::new(profile, backend, Interaction::detect()).with_shell(cli.shell);
    // Keys are only remembered for named sections, literal endpoints have nowhere to go.
    if let Some(store) = HostKeyStore::discover().filter(|_| configured) {
        coordinator = coordinator.with_host_key_store(store);
    }
    tokio::select! {
        attempt = coordinator.unlock_cycle() => {
            let attempt = attempt?;
            info!(host = %alias, phases = attempt.phases.len(), "remote system is unlocked and booted");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(host = %alias, "interrupted, giving up");
            Err(UnlockError::Connection(format!("unlocking {alias} was interrupted")).into())
        }
    }
}

async fn watch(profiles: Vec<HostProfile>, backend: Backend) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut scheduler = WatchScheduler::new(profiles, backend, shutdown.clone())?;
    if let Some(store) = HostKeyStore::discover() {
        scheduler = scheduler.with_host_key_store(store);
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received interrupt, stopping monitors");
                signal.cancel();
            }
            Err(e) => warn!("cannot listen for interrupts: {e}"),
        }
    });

    scheduler.run().await;
    Ok(())
}
