// 🛡️ Everything that touches a process or the network lives below this module.

pub mod traits;     // Global contracts
pub mod secrets;    // Memory hygiene (Passphrase) & password resolution
pub mod ssh;        // OpenSSH client driver
pub mod keyscan;    // ssh-keyscan output
pub mod inspect;    // crypttab / lsblk / ps parsing

use std::sync::Arc;

use crate::sys::secrets::{PassStore, TerminalConsole};
use crate::sys::ssh::SystemSshClient;
use crate::sys::traits::{Console, RemoteShell, SecretStore};

/// The seams every workflow is built on, shared by all hosts.
#[derive(Clone)]
pub struct Backend {
    pub shell: Arc<dyn RemoteShell>,
    pub secrets: Arc<dyn SecretStore>,
    pub console: Arc<dyn Console>,
}

impl Backend {
    pub fn new(shell: Arc<dyn RemoteShell>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            shell,
            secrets,
            console: Arc::new(TerminalConsole),
        }
    }

    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    /// The `ssh` client binary and the `pass` password store.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemSshClient::new()), Arc::new(PassStore))
    }
}
