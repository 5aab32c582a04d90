// src/identify.rs
//
// Tells the initramfs SSH server and the booted system apart. With distinct
// ports the port answering is enough; when both share an address only the
// server banner or the host keys can say which one is listening.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{Endpoint, HostProfile, KnownHostKeys};
use crate::error::UnlockResult;
use crate::sys::keyscan::{ServerDetails, ServerFlavor};
use crate::sys::traits::RemoteShell;

/// What decides which environment answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyBy {
    /// Pre-boot host keys are known (configured or seen earlier).
    HostKeys,
    /// Both environments listen on the same port, so the banner decides.
    ServerHeader,
    /// Distinct ports: whichever port accepts a login is the answer.
    PortNumber,
}

/// Which environment a scan found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    PreBoot,
    PostBoot,
    /// Something answered, but nothing identifies it.
    Unknown,
    /// Nothing answered.
    Silent,
}

#[derive(Clone)]
pub struct ServerIdentifier {
    shell: Arc<dyn RemoteShell>,
    pre_boot: Endpoint,
    post_boot: Endpoint,
    proxy: Option<String>,
    scan_timeout: Duration,
    known: KnownHostKeys,
    pre_boot_header: Option<String>,
}

impl ServerIdentifier {
    pub fn for_profile(shell: Arc<dyn RemoteShell>, profile: &HostProfile) -> UnlockResult<Self> {
        let settings = profile.pre_boot()?;
        Ok(Self {
            shell,
            pre_boot: settings.endpoint.clone(),
            post_boot: profile.post_boot.clone(),
            proxy: settings.ssh_proxy.clone(),
            scan_timeout: profile.timeouts.scan_timeout,
            known: settings.host_keys.clone(),
            pre_boot_header: None,
        })
    }

    pub fn method(&self) -> IdentifyBy {
        if !self.known.pre_boot.is_empty() {
            IdentifyBy::HostKeys
        } else if self.pre_boot.port == self.post_boot.port {
            IdentifyBy::ServerHeader
        } else {
            IdentifyBy::PortNumber
        }
    }

    /// A successful login proves nothing unless the ports differ.
    pub fn needs_scan(&self) -> bool {
        self.method() != IdentifyBy::PortNumber
    }

    /// Both environments are reached through the very same host and port.
    pub fn shares_endpoint(&self) -> bool {
        self.pre_boot.host == self.post_boot.host && self.pre_boot.port == self.post_boot.port
    }

    pub fn knows_pre_boot_keys(&self) -> bool {
        !self.known.pre_boot.is_empty()
    }

    pub fn classify(&self, server: &ServerDetails) -> Environment {
        if server.header.is_empty() && server.host_keys.is_empty() {
            return Environment::Silent;
        }

        if !server.host_keys.is_empty() {
            let pre = !server.host_keys.is_disjoint(&self.known.pre_boot);
            let post = !server.host_keys.is_disjoint(&self.known.post_boot);
            match (pre, post) {
                (true, false) => return Environment::PreBoot,
                (false, true) => return Environment::PostBoot,
                // Shared or unseen keys: the banner has to decide.
                _ => {}
            }
        }

        match server.flavor() {
            ServerFlavor::Dropbear => Environment::PreBoot,
            ServerFlavor::OpenSsh => Environment::PostBoot,
            ServerFlavor::Unknown => {
                if self.knows_pre_boot_keys() && !server.host_keys.is_empty() {
                    return Environment::PostBoot;
                }
                match &self.pre_boot_header {
                    Some(header) if server.header.is_empty() => {
                        trace!(%header, "no banner to compare");
                        Environment::Unknown
                    }
                    Some(header) if *header == server.header => Environment::PreBoot,
                    Some(_) => Environment::PostBoot,
                    None => Environment::Unknown,
                }
            }
        }
    }

    /// Scans the pre-boot endpoint, through the proxy when there is one.
    pub async fn scan_pre_boot(&self) -> ServerDetails {
        self.scan(&self.pre_boot, self.proxy.as_deref()).await
    }

    pub async fn scan_post_boot(&self) -> ServerDetails {
        self.scan(&self.post_boot, None).await
    }

    async fn scan(&self, endpoint: &Endpoint, proxy: Option<&str>) -> ServerDetails {
        match self.shell.scan(endpoint, proxy, self.scan_timeout).await {
            Ok(details) => details,
            Err(e) => {
                debug!(%endpoint, error = %e, "ssh-keyscan failed");
                ServerDetails::default()
            }
        }
    }

    /// Keys and banner of a server that was confirmed to be the pre-boot
    /// environment. Later scans compare against them.
    pub fn remember_pre_boot(&mut self, server: &ServerDetails) {
        if !server.header.is_empty() {
            self.pre_boot_header = Some(server.header.clone());
        }
        self.known.pre_boot.extend(server.host_keys.iter().cloned());
        self.known
            .post_boot
            .retain(|key| !server.host_keys.contains(key));
    }

    pub fn remember_post_boot(&mut self, server: &ServerDetails) {
        self.known.post_boot = server
            .host_keys
            .difference(&self.known.pre_boot)
            .cloned()
            .collect();
    }
}
