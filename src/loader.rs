// src/loader.rs
//
// Discovers and merges the ini files once at startup. Everything after
// `ConfigLoader::from_sources` is pure: no filesystem access, no re-reading.

use ini::{Ini, ParseOption};
use secrecy::SecretString;
use serde::de::value::{Error as ValueError, MapDeserializer};
use serde::{Deserialize, Deserializer, de};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{
    Endpoint, HostProfile, KnownHostKeys, PasswordSource, PreBootSettings, Timeouts,
    local_username, parse_timespan,
};
use crate::error::{UnlockError, UnlockResult};

pub const PROGRAM_NAME: &str = "unlock-remote-system";

/// Lives in the XDG fragment directory, so `discover` reads it back like any
/// other configuration file.
pub const KNOWN_HOSTS_FILE: &str = "known-hosts.ini";

type Section = BTreeMap<String, String>;

// ==============================================================================
// 1. Section schema
// ==============================================================================

/// Options of one `[alias]` section. Empty values count as unset.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SectionConfig {
    #[serde(default, deserialize_with = "non_empty")]
    pre_boot: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    post_boot: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    identity_file: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    known_hosts_file: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    ssh_proxy: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    password: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    password_name: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    password_store: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    named_pipe: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    cryptroot_config: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    cryptroot_program: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    key_script: Option<String>,

    #[serde(default, deserialize_with = "key_list")]
    pre_boot_host_keys: BTreeSet<String>,
    #[serde(default, deserialize_with = "key_list")]
    post_boot_host_keys: BTreeSet<String>,

    #[serde(default, deserialize_with = "timespan")]
    retry_interval: Option<Duration>,
    #[serde(default, deserialize_with = "timespan")]
    connect_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "timespan")]
    boot_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "timespan")]
    scan_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "positive")]
    unreachable_threshold: Option<u32>,

    /// Anything else, reported and ignored.
    #[serde(flatten)]
    unknown: BTreeMap<String, String>,
}

impl SectionConfig {
    fn from_section(section: &Section) -> Result<Self, ValueError> {
        let entries = section.iter().map(|(key, value)| (key.as_str(), value.as_str()));
        Self::deserialize(MapDeserializer::<_, ValueError>::new(entries))
    }
}

fn non_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok(Some(value).filter(|value| !value.is_empty()))
}

fn timespan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    match non_empty(deserializer)? {
        Some(value) => parse_timespan(&value)
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid timespan {value:?}"))),
        None => Ok(None),
    }
}

fn positive<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let Some(value) = non_empty(deserializer)? else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .ok()
        .filter(|number| *number > 0)
        .map(Some)
        .ok_or_else(|| de::Error::custom(format!("expected a positive integer, got {value:?}")))
}

/// Space separated base64 host keys.
fn key_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<String>, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok(value.split_whitespace().map(str::to_string).collect())
}

// ==============================================================================
// 2. ConfigLoader
// ==============================================================================

/// Merged view of every configuration file, keyed by section (host alias).
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    sections: BTreeMap<String, Section>,
    sources: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Reads system, home and XDG config scopes, in that order (later wins).
    pub fn discover() -> UnlockResult<Self> {
        let mut sources = Vec::new();
        for (main, fragments) in candidate_locations() {
            read_scope(&main, &fragments, &mut sources)?;
        }
        Self::from_sources(sources)
    }

    /// Merges already-read `(path, contents)` pairs, later entries overriding
    /// earlier ones key by key.
    pub fn from_sources<I>(sources: I) -> UnlockResult<Self>
    where
        I: IntoIterator<Item = (PathBuf, String)>,
    {
        let mut loader = Self::default();
        for (path, contents) in sources {
            for (section, properties) in parse_ini(&path, &contents)? {
                loader.sections.entry(section).or_default().extend(properties);
            }
            debug!(path = %path.display(), "loaded configuration file");
            loader.sources.push(path);
        }
        Ok(loader)
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// Builds the profile of a configured host.
    pub fn profile(&self, alias: &str) -> UnlockResult<HostProfile> {
        let section = self.sections.get(alias).ok_or_else(|| {
            UnlockError::Configuration(format!("no configuration section named {alias:?}"))
        })?;
        let config = SectionConfig::from_section(section)
            .map_err(|e| UnlockError::Configuration(format!("[{alias}] {e}")))?;
        for key in config.unknown.keys() {
            warn!(section = alias, key = %key, "ignoring unknown configuration option");
        }

        let mut settings =
            PreBootSettings::new(Endpoint::parse(config.pre_boot.as_deref().unwrap_or(alias))?);
        settings.identity_file = config.identity_file.as_deref().map(expand_home);
        settings.known_hosts_file = config.known_hosts_file.as_deref().map(expand_home);
        settings.ssh_proxy = config.ssh_proxy;
        settings.password = match (config.password, config.password_name) {
            (Some(literal), _) => Some(PasswordSource::Literal(SecretString::new(literal))),
            (None, Some(name)) => Some(PasswordSource::Store {
                name,
                store_dir: config.password_store.as_deref().map(expand_home),
            }),
            (None, None) => None,
        };
        if let Some(value) = config.named_pipe {
            settings.named_pipe = value;
        }
        if let Some(value) = config.cryptroot_config {
            settings.cryptroot_config = value;
        }
        if let Some(value) = config.cryptroot_program {
            settings.cryptroot_program = value;
        }
        if let Some(value) = config.key_script {
            settings.key_script = value;
        }
        settings.host_keys = KnownHostKeys {
            pre_boot: config.pre_boot_host_keys,
            post_boot: config.post_boot_host_keys,
        };

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            retry_interval: config.retry_interval.unwrap_or(defaults.retry_interval),
            connect_timeout: config.connect_timeout.unwrap_or(defaults.connect_timeout),
            boot_timeout: config.boot_timeout.unwrap_or(defaults.boot_timeout),
            scan_timeout: config.scan_timeout.unwrap_or(defaults.scan_timeout),
            unreachable_threshold: config
                .unreachable_threshold
                .unwrap_or(defaults.unreachable_threshold),
        };

        Ok(HostProfile {
            alias: alias.to_string(),
            post_boot: Endpoint::parse(config.post_boot.as_deref().unwrap_or(alias))?,
            pre_boot: Some(settings),
            timeouts,
        })
    }

    /// `PRE_BOOT [POST_BOOT]` from the command line: a lone argument naming a
    /// section loads it, anything else is a literal endpoint.
    pub fn resolve(&self, pre_boot: &str, post_boot: Option<&str>) -> UnlockResult<HostProfile> {
        if post_boot.is_none() && self.has_section(pre_boot) {
            debug!(section = pre_boot, "loading configuration section");
            return self.profile(pre_boot);
        }
        HostProfile::literal(pre_boot, post_boot)
    }

    /// Profile for `reboot-remote-system NAME`. Unconfigured names are plain
    /// SSH destinations logged into as the local user.
    pub fn reboot_profile(&self, name: &str) -> UnlockResult<HostProfile> {
        if self.has_section(name) {
            return self.profile(name);
        }
        let mut endpoint = Endpoint::parse(name)?;
        if !name.contains('@') {
            endpoint.user = local_username();
        }
        Ok(HostProfile::plain(endpoint.host.clone(), endpoint))
    }

    pub fn all_profiles(&self) -> UnlockResult<Vec<HostProfile>> {
        self.section_names().map(|alias| self.profile(alias)).collect()
    }
}

/// `(main file, fragment directory)` per scope, lowest precedence first.
pub fn candidate_locations() -> Vec<(PathBuf, PathBuf)> {
    let mut locations = vec![(
        PathBuf::from(format!("/etc/{PROGRAM_NAME}.ini")),
        PathBuf::from(format!("/etc/{PROGRAM_NAME}.d")),
    )];
    if let Some(home) = dirs::home_dir() {
        locations.push((
            home.join(format!(".{PROGRAM_NAME}.ini")),
            home.join(format!(".{PROGRAM_NAME}.d")),
        ));
    }
    if let Some(config) = dirs::config_dir() {
        locations.push((
            config.join(format!("{PROGRAM_NAME}.ini")),
            config.join(format!("{PROGRAM_NAME}.d")),
        ));
    }
    locations
}

/// Main file first, then `*.ini` fragments sorted by name.
fn read_scope(main: &Path, fragments: &Path, out: &mut Vec<(PathBuf, String)>) -> UnlockResult<()> {
    if main.is_file() {
        out.push((main.to_path_buf(), read_config(main)?));
    }
    if fragments.is_dir() {
        let mut paths: Vec<PathBuf> = fs::read_dir(fragments)
            .map_err(|e| read_error(fragments, e))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "ini") && path.is_file())
            .collect();
        paths.sort();
        for path in paths {
            let contents = read_config(&path)?;
            out.push((path, contents));
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> UnlockResult<String> {
    fs::read_to_string(path).map_err(|e| read_error(path, e))
}

fn read_error(path: &Path, e: std::io::Error) -> UnlockError {
    UnlockError::Configuration(format!("failed to read {}: {e}", path.display()))
}

fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

/// `[section]` blocks with lowercased keys, in file order. Escapes and
/// quotes are left alone so passphrases survive verbatim.
fn parse_ini(path: &Path, text: &str) -> UnlockResult<Vec<(String, Section)>> {
    let options = ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    };
    let ini = Ini::load_from_str_opt(text, options).map_err(|e| {
        UnlockError::Configuration(format!("{}: {e}", path.display()))
    })?;

    let mut sections = Vec::new();
    for (name, properties) in ini.iter() {
        let Some(name) = name else {
            if properties.is_empty() {
                continue;
            }
            return Err(UnlockError::Configuration(format!(
                "{}: options outside of a [section]",
                path.display()
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(UnlockError::Configuration(format!(
                "{}: empty section name",
                path.display()
            )));
        }
        let section = properties
            .iter()
            .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
            .collect();
        sections.push((name.to_string(), section));
    }
    Ok(sections)
}

// ==============================================================================
// 3. Host key store
// ==============================================================================

/// Remembers the host keys of both environments per section, so later runs
/// can tell them apart on a shared address without trusting the banner.
#[derive(Debug, Clone)]
pub struct HostKeyStore {
    path: PathBuf,
}

impl HostKeyStore {
    /// `~/.config/unlock-remote-system.d/known-hosts.ini`
    pub fn discover() -> Option<Self> {
        dirs::config_dir().map(|config| {
            Self::at(config.join(format!("{PROGRAM_NAME}.d")).join(KNOWN_HOSTS_FILE))
        })
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Rewrites the `alias` section, keeping every other section as it was.
    pub fn store(
        &self,
        alias: &str,
        pre_boot: &BTreeSet<String>,
        post_boot: &BTreeSet<String>,
    ) -> UnlockResult<()> {
        if let Some(directory) = self.path.parent() {
            fs::create_dir_all(directory).map_err(|e| write_error(directory, e))?;
        }
        let mut ini = match self.path.is_file() {
            true => Ini::load_from_file_noescape(&self.path).map_err(|e| {
                UnlockError::Configuration(format!("{}: {e}", self.path.display()))
            })?,
            false => Ini::new(),
        };
        ini.with_section(Some(alias))
            .set("pre-boot-host-keys", join_keys(pre_boot))
            .set("post-boot-host-keys", join_keys(post_boot));
        ini.write_to_file(&self.path)
            .map_err(|e| write_error(&self.path, e))?;
        info!(host = alias, path = %self.path.display(), "stored SSH host keys");
        Ok(())
    }
}

fn join_keys(keys: &BTreeSet<String>) -> String {
    keys.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

fn write_error(path: &Path, e: std::io::Error) -> UnlockError {
    UnlockError::Configuration(format!("failed to write {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostKeyPolicy;
    use std::time::Duration;

    fn loader(files: &[(&str, &str)]) -> ConfigLoader {
        ConfigLoader::from_sources(
            files
                .iter()
                .map(|(path, text)| (PathBuf::from(path), text.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn sections_become_profiles() {
        let loader = loader(&[(
            "/etc/unlock-remote-system.ini",
            "# fleet\n\
             [db1]\n\
             pre-boot = root@10.0.0.5:2222\n\
             post-boot: admin@db1.example.net\n\
             password-name = hosts/db1\n\
             known-hosts-file = /etc/unlock/known_hosts\n\
             ssh-proxy = bastion\n\
             boot-timeout = 10m\n\
             unreachable-threshold = 5\n",
        )]);

        let profile = loader.profile("db1").unwrap();
        assert_eq!(profile.alias, "db1");
        assert_eq!(profile.post_boot, Endpoint::new("admin", "db1.example.net", 22));
        assert_eq!(profile.timeouts.boot_timeout, Duration::from_secs(600));
        assert_eq!(profile.timeouts.unreachable_threshold, 5);
        assert_eq!(profile.timeouts.connect_timeout, Duration::from_secs(120));

        let pre = profile.pre_boot().unwrap();
        assert_eq!(pre.endpoint, Endpoint::new("root", "10.0.0.5", 2222));
        assert_eq!(pre.ssh_proxy.as_deref(), Some("bastion"));
        assert!(matches!(
            pre.password,
            Some(PasswordSource::Store { ref name, store_dir: None }) if name == "hosts/db1"
        ));
        assert_eq!(
            pre.target().host_keys,
            HostKeyPolicy::Verify(PathBuf::from("/etc/unlock/known_hosts"))
        );
    }

    #[test]
    fn endpoints_default_to_the_section_name() {
        let loader = loader(&[("/etc/unlock-remote-system.ini", "[web1]\npassword = hunter2\n")]);
        let profile = loader.profile("web1").unwrap();
        assert_eq!(profile.post_boot, Endpoint::new("root", "web1", 22));
        assert_eq!(profile.pre_boot().unwrap().endpoint, Endpoint::new("root", "web1", 22));
    }

    #[test]
    fn later_files_override_earlier_ones_per_key() {
        let loader = loader(&[
            ("/etc/unlock-remote-system.ini", "[db1]\npre-boot = db1:2222\nscan-timeout = 5s\n"),
            ("/etc/unlock-remote-system.d/10-db1.ini", "[db1]\nscan-timeout = 9s\n"),
            ("/home/ops/.config/unlock-remote-system.ini", "[db1]\nretry-interval = 2\n"),
        ]);
        let profile = loader.profile("db1").unwrap();
        assert_eq!(profile.pre_boot().unwrap().endpoint.port, 2222);
        assert_eq!(profile.timeouts.scan_timeout, Duration::from_secs(9));
        assert_eq!(profile.timeouts.retry_interval, Duration::from_secs(2));
        assert_eq!(loader.sources().len(), 3);
    }

    #[test]
    fn unmatched_arguments_are_literal_endpoints() {
        let loader = loader(&[("/etc/unlock-remote-system.ini", "[db1]\n")]);
        let profile = loader.resolve("root@203.0.113.5:2222", None).unwrap();
        assert_eq!(
            profile.pre_boot().unwrap().endpoint,
            Endpoint::new("root", "203.0.113.5", 2222)
        );
        assert_eq!(profile.post_boot.port, 22);

        let configured = loader.resolve("db1", None).unwrap();
        assert_eq!(configured.alias, "db1");

        // Two arguments are always literal, even if the first names a section.
        let literal = loader.resolve("db1", Some("admin@db1")).unwrap();
        assert_eq!(literal.post_boot, Endpoint::new("admin", "db1", 22));
    }

    #[test]
    fn reboot_profiles_fall_back_to_plain_hosts() {
        let loader = loader(&[]);
        let profile = loader.reboot_profile("deploy@web1:2200").unwrap();
        assert_eq!(profile.post_boot, Endpoint::new("deploy", "web1", 2200));
        assert!(!profile.has_encryption());
    }

    #[test]
    fn malformed_files_are_configuration_errors() {
        let orphan = ConfigLoader::from_sources([(PathBuf::from("a.ini"), "key = value\n".to_string())]);
        assert!(matches!(orphan, Err(UnlockError::Configuration(_))));

        let garbage = ConfigLoader::from_sources([(PathBuf::from("b.ini"), "[x]\nnonsense\n".to_string())]);
        assert!(matches!(garbage, Err(UnlockError::Configuration(_))));

        let loader = loader(&[("c.ini", "[x]\nboot-timeout = whenever\n")]);
        assert!(matches!(loader.profile("x"), Err(UnlockError::Configuration(_))));
    }

    #[test]
    fn scopes_are_read_main_file_first_then_sorted_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("unlock-remote-system.ini");
        let fragments = dir.path().join("unlock-remote-system.d");
        fs::create_dir(&fragments).unwrap();
        fs::write(&main, "[db1]\nscan-timeout = 1\n").unwrap();
        fs::write(fragments.join("20-late.ini"), "[db1]\nscan-timeout = 3\n").unwrap();
        fs::write(fragments.join("10-early.ini"), "[db1]\nscan-timeout = 2\n").unwrap();
        fs::write(fragments.join("notes.txt"), "[db1]\nscan-timeout = 99\n").unwrap();

        let mut sources = Vec::new();
        read_scope(&main, &fragments, &mut sources).unwrap();
        let names: Vec<String> = sources
            .iter()
            .map(|(path, _)| path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["unlock-remote-system.ini", "10-early.ini", "20-late.ini"]);

        let loader = ConfigLoader::from_sources(sources).unwrap();
        assert_eq!(
            loader.profile("db1").unwrap().timeouts.scan_timeout,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn stored_host_keys_become_known_keys() {
        let loader = loader(&[
            ("/etc/unlock-remote-system.ini", "[db1]\npre-boot = db1:2222\n"),
            (
                "/home/ops/.config/unlock-remote-system.d/known-hosts.ini",
                "[db1]\npre-boot-host-keys = AAAAone AAAAtwo\npost-boot-host-keys = AAAAthree\n",
            ),
        ]);
        let keys = loader.profile("db1").unwrap().pre_boot.unwrap().host_keys;
        assert_eq!(keys.pre_boot.len(), 2);
        assert!(keys.pre_boot.contains("AAAAtwo"));
        assert!(keys.post_boot.contains("AAAAthree"));
    }

    #[test]
    fn passphrases_are_taken_verbatim() {
        use secrecy::ExposeSecret;
        let loader = loader(&[("a.ini", "[x]\npassword = \"c:\\tmp\"#1\n")]);
        let profile = loader.profile("x").unwrap();
        let Some(PasswordSource::Literal(secret)) = &profile.pre_boot().unwrap().password else {
            panic!("expected a literal password");
        };
        assert_eq!(secret.expose_secret(), "\"c:\\tmp\"#1");
    }

    #[test]
    fn unknown_options_are_ignored() {
        let loader = loader(&[("a.ini", "[x]\nColour = blue\nScan-Timeout = 7\n")]);
        let profile = loader.profile("x").unwrap();
        assert_eq!(profile.timeouts.scan_timeout, Duration::from_secs(7));
    }

    #[test]
    fn host_key_store_keeps_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unlock-remote-system.d").join(KNOWN_HOSTS_FILE);
        let store = HostKeyStore::at(path.clone());
        let keys = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>();

        store.store("db1", &keys(&["AAAApre1"]), &keys(&["AAAApost1"])).unwrap();
        store.store("db2", &keys(&["AAAApre2", "AAAApre3"]), &keys(&["AAAApost2"])).unwrap();
        store.store("db1", &keys(&["AAAApre4"]), &keys(&["AAAApost1"])).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let loader = ConfigLoader::from_sources([(path, text)]).unwrap();
        let db1 = loader.profile("db1").unwrap().pre_boot.unwrap().host_keys;
        let db2 = loader.profile("db2").unwrap().pre_boot.unwrap().host_keys;
        assert_eq!(db1.pre_boot, keys(&["AAAApre4"]));
        assert_eq!(db2.pre_boot, keys(&["AAAApre2", "AAAApre3"]));
        assert_eq!(db2.post_boot, keys(&["AAAApost2"]));
    }
}
