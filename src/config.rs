// src/config.rs

use regex::Regex;
use secrecy::SecretString;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{UnlockError, UnlockResult};

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PORT: u16 = 22;

pub const DEFAULT_NAMED_PIPE: &str = "/lib/cryptsetup/passfifo";
pub const DEFAULT_CRYPTROOT_CONFIG: &str = "/conf/conf.d/cryptroot";
pub const DEFAULT_CRYPTROOT_PROGRAM: &str = "/scripts/local-top/cryptroot";
pub const DEFAULT_KEY_SCRIPT: &str = "/tmp/keyscript.sh";

static EXPRESSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<user>[^@\s]+)@)?(?P<host>\[[\w:.%]+\]|[^@:\[\]\s]+)(?::(?P<port>\d+))?$")
        .expect("endpoint expression pattern is valid")
});

// ==============================================================================
// 1. Endpoints
// ==============================================================================

/// A fully normalized SSH endpoint. Parsing always fills in `root` and `22`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// Parses `[user@]host[:port]`. IPv6 addresses must be bracketed.
    pub fn parse(expression: &str) -> UnlockResult<Self> {
        let expression = expression.trim();
        let captures = EXPRESSION_PATTERN.captures(expression).ok_or_else(|| {
            UnlockError::Configuration(format!(
                "failed to parse connection profile expression {expression:?}"
            ))
        })?;

        let port = match captures.name("port") {
            Some(port) => port.as_str().parse::<u16>().map_err(|_| {
                UnlockError::Configuration(format!(
                    "port number out of range in {expression:?}"
                ))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            user: captures
                .name("user")
                .map_or(DEFAULT_USER, |m| m.as_str())
                .to_string(),
            host: captures["host"]
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            port,
        })
    }

    /// The host as it has to appear in front of `:port`.
    pub fn bracketed_host(&self) -> Cow<'_, str> {
        if self.host.contains(':') {
            Cow::Owned(format!("[{}]", self.host))
        } else {
            Cow::Borrowed(&self.host)
        }
    }

    /// The same host on the default SSH port, logged in as `user`.
    pub fn sibling(&self, user: impl Into<String>) -> Self {
        Self::new(user, self.host.clone(), DEFAULT_PORT)
    }
}

impl FromStr for Endpoint {
    type Err = UnlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.bracketed_host(), self.port)
    }
}

// ==============================================================================
// 2. Host key policy & SSH targets
// ==============================================================================

/// How `ssh` treats the remote host key for one target.
///
/// `SkipForPreBoot` exists because the initramfs SSH server (usually Dropbear)
/// and the booted system present different host keys for the same address. It
/// is only ever chosen for a pre-boot target with no known-hosts file
/// configured. Post-boot targets always get `SystemDefault`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Whatever the operator's ssh configuration says.
    SystemDefault,
    /// Strict checking against a dedicated, read-only known-hosts file.
    Verify(PathBuf),
    /// No host key verification at all (pre-boot only).
    SkipForPreBoot,
}

/// Everything the session layer needs to reach one environment of one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub endpoint: Endpoint,
    pub identity_file: Option<PathBuf>,
    pub host_keys: HostKeyPolicy,
    pub proxy: Option<String>,
}

impl SshTarget {
    pub fn plain(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            identity_file: None,
            host_keys: HostKeyPolicy::SystemDefault,
            proxy: None,
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proxy {
            Some(proxy) => write!(f, "{} (via {})", self.endpoint, proxy),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

// ==============================================================================
// 3. Password references
// ==============================================================================

/// Where the disk encryption passphrase comes from. Nothing is resolved here.
#[derive(Clone, Debug)]
pub enum PasswordSource {
    /// Literal value from the configuration file.
    Literal(SecretString),
    /// Lookup through the `pass` password store.
    Store {
        name: String,
        store_dir: Option<PathBuf>,
    },
    /// Ask the operator on the controlling terminal.
    Prompt,
}

// ==============================================================================
// 4. Timing budgets
// ==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub boot_timeout: Duration,
    pub scan_timeout: Duration,
    /// Consecutive post-boot misses before watch mode assumes a reboot.
    pub unreachable_threshold: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2 * 60),
            boot_timeout: Duration::from_secs(5 * 60),
            scan_timeout: Duration::from_secs(5),
            unreachable_threshold: 3,
        }
    }
}

/// Parses `5m`, `90s`, `1h 30m` and bare numbers (seconds).
pub fn parse_timespan(value: &str) -> UnlockResult<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(value)
        .map_err(|e| UnlockError::Configuration(format!("invalid timespan {value:?}: {e}")))
}

// ==============================================================================
// 5. Host profile
// ==============================================================================

/// Base64 host keys (the last `ssh-keyscan` column) each environment is
/// known to present. Either set may be empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownHostKeys {
    pub pre_boot: BTreeSet<String>,
    pub post_boot: BTreeSet<String>,
}

impl KnownHostKeys {
    pub fn is_empty(&self) -> bool {
        self.pre_boot.is_empty() && self.post_boot.is_empty()
    }
}

/// Settings that only matter when the host stops in an encrypted pre-boot
/// environment. Their presence is what "encryption is configured" means.
#[derive(Clone, Debug)]
pub struct PreBootSettings {
    pub endpoint: Endpoint,
    pub identity_file: Option<PathBuf>,
    pub known_hosts_file: Option<PathBuf>,
    pub ssh_proxy: Option<String>,
    pub password: Option<PasswordSource>,
    pub named_pipe: String,
    pub cryptroot_config: String,
    pub cryptroot_program: String,
    pub key_script: String,
    pub host_keys: KnownHostKeys,
}

impl PreBootSettings {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            identity_file: None,
            known_hosts_file: None,
            ssh_proxy: None,
            password: None,
            named_pipe: DEFAULT_NAMED_PIPE.to_string(),
            cryptroot_config: DEFAULT_CRYPTROOT_CONFIG.to_string(),
            cryptroot_program: DEFAULT_CRYPTROOT_PROGRAM.to_string(),
            key_script: DEFAULT_KEY_SCRIPT.to_string(),
            host_keys: KnownHostKeys::default(),
        }
    }

    pub fn target(&self) -> SshTarget {
        let host_keys = match &self.known_hosts_file {
            Some(path) => HostKeyPolicy::Verify(path.clone()),
            None => HostKeyPolicy::SkipForPreBoot,
        };
        SshTarget {
            endpoint: self.endpoint.clone(),
            identity_file: self.identity_file.clone(),
            host_keys,
            proxy: self.ssh_proxy.clone(),
        }
    }
}

/// Resolved, immutable settings for one host.
#[derive(Clone, Debug)]
pub struct HostProfile {
    pub alias: String,
    pub post_boot: Endpoint,
    pub pre_boot: Option<PreBootSettings>,
    pub timeouts: Timeouts,
}

impl HostProfile {
    /// A profile for a host without disk encryption (reboot only).
    pub fn plain(alias: impl Into<String>, post_boot: Endpoint) -> Self {
        Self {
            alias: alias.into(),
            post_boot,
            pre_boot: None,
            timeouts: Timeouts::default(),
        }
    }

    /// A profile built from literal `PRE_BOOT [POST_BOOT]` expressions.
    ///
    /// Without `POST_BOOT` the booted system is assumed to listen on port 22
    /// of the same host and to accept the local login name.
    pub fn literal(pre_boot: &str, post_boot: Option<&str>) -> UnlockResult<Self> {
        let pre = Endpoint::parse(pre_boot)?;
        let post = match post_boot {
            Some(expression) => Endpoint::parse(expression)?,
            None => pre.sibling(local_username()),
        };
        Ok(Self {
            alias: pre.host.clone(),
            post_boot: post,
            pre_boot: Some(PreBootSettings::new(pre)),
            timeouts: Timeouts::default(),
        })
    }

    pub fn has_encryption(&self) -> bool {
        self.pre_boot.is_some()
    }

    pub fn pre_boot(&self) -> UnlockResult<&PreBootSettings> {
        self.pre_boot.as_ref().ok_or_else(|| {
            UnlockError::Configuration(format!(
                "no pre-boot configuration available for {}",
                self.alias
            ))
        })
    }

    pub fn post_boot_target(&self) -> SshTarget {
        SshTarget::plain(self.post_boot.clone())
    }
}

/// Login name of the operator running this process.
pub fn local_username() -> String {
    for name in ["USER", "LOGNAME"] {
        if let Ok(value) = env::var(name) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| DEFAULT_USER.to_string())
}
