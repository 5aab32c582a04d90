// src/sys/keyscan.rs

use std::collections::BTreeSet;

/// What an SSH server tells anyone who connects: its banner and its host keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDetails {
    pub header: String,
    pub host_keys: BTreeSet<String>,
}

/// Best guess at which environment answered, based on the SSH banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFlavor {
    /// Dropbear inside the initramfs, as expected for a pre-boot environment.
    Dropbear,
    /// OpenSSH, which usually means the booted system answered.
    OpenSsh,
    Unknown,
}

impl ServerDetails {
    pub fn from_keyscan(stdout: &str, stderr: &str) -> Self {
        Self {
            header: parse_server_header(stderr).unwrap_or_default(),
            host_keys: parse_host_keys(stdout),
        }
    }

    pub fn flavor(&self) -> ServerFlavor {
        let header = self.header.to_lowercase();
        if header.contains("dropbear") {
            ServerFlavor::Dropbear
        } else if header.contains("openssh") {
            ServerFlavor::OpenSsh
        } else {
            ServerFlavor::Unknown
        }
    }
}

/// `host key-type base64-key` lines on stdout.
fn parse_host_keys(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            (tokens.len() >= 3).then(|| tokens[2].to_string())
        })
        .collect()
}

/// `# host:port SSH-2.0-dropbear_2020.81` comments on stderr.
fn parse_server_header(stderr: &str) -> Option<String> {
    stderr.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        (tokens.len() >= 3 && tokens[0] == "#").then(|| tokens[2].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DROPBEAR_STDERR: &str = "# 10.0.0.5:2222 SSH-2.0-dropbear_2020.81\n";
    const OPENSSH_STDERR: &str = "# 10.0.0.5:22 SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6\n";
    const KEYS: &str = "\
[10.0.0.5]:2222 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDropbearKey
[10.0.0.5]:2222 ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQDropbearRsa
";

    #[test]
    fn dropbear_banner_is_recognized() {
        let details = ServerDetails::from_keyscan(KEYS, DROPBEAR_STDERR);
        assert_eq!(details.header, "SSH-2.0-dropbear_2020.81");
        assert_eq!(details.flavor(), ServerFlavor::Dropbear);
        assert_eq!(details.host_keys.len(), 2);
    }

    #[test]
    fn openssh_banner_is_recognized() {
        let details = ServerDetails::from_keyscan("", OPENSSH_STDERR);
        assert_eq!(details.flavor(), ServerFlavor::OpenSsh);
        assert!(details.host_keys.is_empty());
    }

    #[test]
    fn silence_means_unknown() {
        let details = ServerDetails::from_keyscan("", "");
        assert_eq!(details.flavor(), ServerFlavor::Unknown);
    }
}
