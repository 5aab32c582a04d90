// src/sys/ssh.rs

use async_trait::async_trait;
use std::borrow::Cow;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::{Endpoint, HostKeyPolicy, SshTarget};
use crate::sys::keyscan::ServerDetails;
use crate::sys::traits::{
    CommandOutput, RemoteCommand, RemoteShell, ShellError, classify_ssh_failure,
};

const SSH_PROGRAM: &str = "ssh";
const KEYSCAN_PROGRAM: &str = "ssh-keyscan";

/// `ssh` exits with this status when the failure is its own, not the remote command's.
const SSH_FAILURE_STATUS: i32 = 255;

/// Drives the OpenSSH client binary.
///
/// Every child is spawned with `kill_on_drop`, so cancelling a future that is
/// waiting on a remote command tears the connection down with it.
pub struct SystemSshClient {
    program: String,
}

impl SystemSshClient {
    pub fn new() -> Self {
        Self {
            program: SSH_PROGRAM.to_string(),
        }
    }

    /// Client options for `target`, ending with the destination host.
    fn connection_args(target: &SshTarget, connect_timeout: Duration) -> Vec<String> {
        let endpoint = &target.endpoint;
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            endpoint.port.to_string(),
            "-l".to_string(),
            endpoint.user.clone(),
        ];

        if let Some(identity) = &target.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }

        match &target.host_keys {
            HostKeyPolicy::SystemDefault => {}
            // 🛡️ Strict checking: ssh refuses unknown keys and never appends to the file.
            HostKeyPolicy::Verify(path) => {
                args.push("-o".to_string());
                args.push("StrictHostKeyChecking=yes".to_string());
                args.push("-o".to_string());
                args.push(format!("UserKnownHostsFile={}", path.display()));
            }
            HostKeyPolicy::SkipForPreBoot => {
                for option in [
                    "StrictHostKeyChecking=no",
                    "UserKnownHostsFile=/dev/null",
                    "GlobalKnownHostsFile=/dev/null",
                    "LogLevel=ERROR",
                ] {
                    args.push("-o".to_string());
                    args.push(option.to_string());
                }
            }
        }

        if let Some(proxy) = &target.proxy {
            args.push("-o".to_string());
            args.push(format!(
                "ProxyCommand=ssh {} -W {}:{}",
                quote(proxy),
                quote(&endpoint.bracketed_host()),
                endpoint.port
            ));
        }

        args.push(endpoint.host.clone());
        args
    }

    /// Runs ssh with our terminal attached. `remote` is the command to run
    /// instead of a login shell.
    async fn terminal_session(
        &self,
        target: &SshTarget,
        remote: Option<&[String]>,
    ) -> Result<i32, ShellError> {
        let mut args = Self::connection_args(target, Duration::from_secs(30));
        // BatchMode would forbid password prompts the operator can answer here.
        args.drain(0..2);
        args.insert(0, "-t".to_string());
        if let Some(argv) = remote {
            args.push("--".to_string());
            args.push(remote_command_line(argv));
        }

        let status = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| ShellError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        match status.code() {
            Some(SSH_FAILURE_STATUS) | None => Err(ShellError::NotListening {
                target: target.to_string(),
                detail: "terminal session ended with status 255".to_string(),
            }),
            Some(code) => Ok(code),
        }
    }
}

impl Default for SystemSshClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Quotes one argument for the remote POSIX shell.
fn quote(arg: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(arg)).into_owned()
}

/// Joins argv into the single command string ssh hands to the remote shell.
fn remote_command_line(argv: &[String]) -> String {
    argv.iter().map(|arg| quote(arg)).collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl RemoteShell for SystemSshClient {
    async fn execute(
        &self,
        target: &SshTarget,
        command: RemoteCommand,
    ) -> Result<CommandOutput, ShellError> {
        let label = target.to_string();
        let mut args = Self::connection_args(target, command.timeout);
        args.push("--".to_string());
        args.push(remote_command_line(&command.argv));
        debug!(target = %label, program = command.program(), "running remote command");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShellError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let run = async {
            if let (Some(payload), Some(mut stdin)) = (command.stdin.as_ref(), child.stdin.take())
            {
                // A closed pipe here shows up again as the exit status below.
                let _ = stdin.write_all(payload).await;
                let _ = stdin.shutdown().await;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(command.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ShellError::Spawn {
                    program: self.program.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(ShellError::TimedOut {
                    target: label,
                    after: command.timeout,
                });
            }
        };

        let status = output.status.code().unwrap_or(SSH_FAILURE_STATUS);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if status == SSH_FAILURE_STATUS {
            return Err(classify_ssh_failure(&label, &stderr));
        }

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn scan(
        &self,
        endpoint: &Endpoint,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<ServerDetails, ShellError> {
        let keyscan_args = vec![
            KEYSCAN_PROGRAM.to_string(),
            "-p".to_string(),
            endpoint.port.to_string(),
            "-T".to_string(),
            timeout.as_secs().max(1).to_string(),
            endpoint.host.clone(),
        ];

        // Through a proxy the scan has to run where the proxy can see the host.
        let mut command = match proxy {
            Some(proxy) => {
                let mut command = Command::new(&self.program);
                command
                    .args(["-o", "BatchMode=yes", proxy, "--"])
                    .arg(remote_command_line(&keyscan_args));
                command
            }
            None => {
                let mut command = Command::new(KEYSCAN_PROGRAM);
                command.args(&keyscan_args[1..]);
                command
            }
        };

        let output = tokio::time::timeout(
            timeout * 2,
            command
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ShellError::TimedOut {
            target: endpoint.to_string(),
            after: timeout * 2,
        })?
        .map_err(|source| ShellError::Spawn {
            program: KEYSCAN_PROGRAM.to_string(),
            source,
        })?;

        Ok(ServerDetails::from_keyscan(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn interactive_shell(&self, target: &SshTarget) -> Result<(), ShellError> {
        self.terminal_session(target, None).await.map(|_| ())
    }

    async fn run_on_terminal(
        &self,
        target: &SshTarget,
        argv: Vec<String>,
    ) -> Result<i32, ShellError> {
        self.terminal_session(target, Some(&argv)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn pre_boot_target() -> SshTarget {
        SshTarget {
            endpoint: Endpoint::new("root", "10.0.0.5", 2222),
            identity_file: Some(PathBuf::from("/home/ops/.ssh/unlock_ed25519")),
            host_keys: HostKeyPolicy::SkipForPreBoot,
            proxy: Some("bastion".to_string()),
        }
    }

    fn option_values(args: &[String]) -> Vec<&str> {
        args.windows(2)
            .filter(|pair| pair[0] == "-o")
            .map(|pair| pair[1].as_str())
            .collect()
    }

    #[test]
    fn pre_boot_targets_skip_host_keys_and_use_the_proxy() {
        let args = SystemSshClient::connection_args(&pre_boot_target(), Duration::from_secs(5));
        let options = option_values(&args);
        assert!(options.contains(&"StrictHostKeyChecking=no"));
        assert!(options.contains(&"UserKnownHostsFile=/dev/null"));
        assert!(options.contains(&"ProxyCommand=ssh bastion -W 10.0.0.5:2222"));
        assert!(options.contains(&"ConnectTimeout=5"));
        assert_eq!(args.last().map(String::as_str), Some("10.0.0.5"));
        assert!(args.windows(2).any(|p| p[0] == "-p" && p[1] == "2222"));
        assert!(args.windows(2).any(|p| p[0] == "-i" && p[1] == "/home/ops/.ssh/unlock_ed25519"));
    }

    #[test]
    fn known_hosts_file_enables_strict_checking() {
        let mut target = pre_boot_target();
        target.host_keys = HostKeyPolicy::Verify(PathBuf::from("/etc/unlock/known_hosts"));
        let args = SystemSshClient::connection_args(&target, Duration::from_secs(5));
        let options = option_values(&args);
        assert!(options.contains(&"StrictHostKeyChecking=yes"));
        assert!(options.contains(&"UserKnownHostsFile=/etc/unlock/known_hosts"));
        assert!(!options.contains(&"StrictHostKeyChecking=no"));
    }

    #[test]
    fn system_default_adds_no_host_key_options() {
        let target = SshTarget::plain(Endpoint::new("ops", "db1", 22));
        let args = SystemSshClient::connection_args(&target, Duration::from_secs(5));
        assert!(!option_values(&args).iter().any(|o| o.contains("HostKey")));
        assert!(!option_values(&args).iter().any(|o| o.contains("KnownHosts")));
    }

    #[test]
    fn proxied_ipv6_hosts_are_bracketed() {
        let mut target = pre_boot_target();
        target.endpoint = Endpoint::new("root", "fe80::1", 2222);
        let args = SystemSshClient::connection_args(&target, Duration::from_secs(5));
        assert!(option_values(&args).contains(&"ProxyCommand=ssh bastion -W '[fe80::1]':2222"));
        assert_eq!(args.last().map(String::as_str), Some("fe80::1"));
    }

    #[test]
    fn remote_arguments_are_quoted() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > \"$1\"".to_string(),
            "unlock".to_string(),
            "/lib/cryptsetup/passfifo".to_string(),
        ];
        assert_eq!(
            remote_command_line(&argv),
            "sh -c 'cat > \"$1\"' unlock /lib/cryptsetup/passfifo"
        );
    }
}
