// src/bin/reboot-remote-system.rs

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::process::ExitCode;
use tracing::{error, info, warn};

use remote_unlock::error::UnlockError;
use remote_unlock::loader::{ConfigLoader, HostKeyStore};
use remote_unlock::sys::Backend;
use remote_unlock::{exit_code_for, logging, run_reboot_cycle};

/// Reboot a remote system and wait for it to come back online.
///
/// When SSH_ALIAS names an `unlock-remote-system` configuration section the
/// root disk encryption is unlocked during the reboot. Systems that use root
/// disk encryption without such a section are not rebooted.
#[derive(Parser, Debug)]
#[command(name = "reboot-remote-system", version, about, long_about = None)]
struct Cli {
    /// Start an interactive shell once the remote system is back.
    #[arg(short, long)]
    shell: bool,

    /// Increase logging verbosity (can be repeated).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (can be repeated).
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,

    #[arg(value_name = "SSH_ALIAS")]
    name: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbosity = (cli.verbose.min(8) as i8) - (cli.quiet.min(8) as i8);
    if let Err(e) = logging::init(verbosity) {
        eprintln!("reboot-remote-system: {e}");
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

async fn run(cli: Cli) -> Result<()> {
    let loader = ConfigLoader::discover()?;
    let cycle = run_reboot_cycle(
        &loader,
        Backend::system(),
        HostKeyStore::discover(),
        &cli.name,
        cli.shell,
    );
    let attempt = tokio::select! {
        attempt = cycle => attempt?,
        _ = tokio::signal::ctrl_c() => {
            warn!(host = %cli.name, "interrupted, giving up");
            return Err(UnlockError::Connection(format!("rebooting {} was interrupted", cli.name)).into());
        }
    };
    let took = attempt
        .finished_at
        .map(|finished| finished - attempt.started_at)
        .and_then(|elapsed| elapsed.to_std().ok())
        .unwrap_or_default();
    info!(
        host = %attempt.alias,
        took = %humantime::format_duration(std::time::Duration::from_secs(took.as_secs())),
        "remote system has been rebooted"
    );
    Ok(())
}
