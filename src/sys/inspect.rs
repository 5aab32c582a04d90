// src/sys/inspect.rs
//
// Parsers for the output of inspection commands run on remote hosts.

/// One line of `/etc/crypttab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub target: String,
    pub source: String,
    pub options: Vec<String>,
}

/// Where a crypttab source actually lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDevice {
    /// A block device node, safe to hand to `lsblk`.
    Block(String),
    /// A regular file (loopback image, etc). Device inspection does not apply.
    File(String),
}

impl CrypttabEntry {
    /// `swap` and `tmp` volumes get a fresh random key on every boot and never hold `/`.
    pub fn is_volatile(&self) -> bool {
        self.options
            .iter()
            .any(|option| option == "swap" || option == "tmp" || option.starts_with("tmp="))
    }

    /// Resolves `UUID=`, `PARTUUID=`, `LABEL=` and `PARTLABEL=` to their udev paths.
    pub fn source_device(&self) -> SourceDevice {
        let aliases = [
            ("UUID=", "/dev/disk/by-uuid/"),
            ("PARTUUID=", "/dev/disk/by-partuuid/"),
            ("LABEL=", "/dev/disk/by-label/"),
            ("PARTLABEL=", "/dev/disk/by-partlabel/"),
        ];
        for (prefix, directory) in aliases {
            if let Some(value) = self.source.strip_prefix(prefix) {
                return SourceDevice::Block(format!("{directory}{value}"));
            }
        }
        if self.source.starts_with("/dev/") {
            SourceDevice::Block(self.source.clone())
        } else {
            SourceDevice::File(self.source.clone())
        }
    }
}

pub fn parse_crypttab(contents: &str) -> Vec<CrypttabEntry> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let target = fields.next()?.to_string();
            let source = fields.next()?.to_string();
            // The key file column is irrelevant for finding the root device.
            let options = fields
                .nth(1)
                .map(|opts| opts.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            Some(CrypttabEntry {
                target,
                source,
                options,
            })
        })
        .collect()
}

/// True when the `lsblk` listing shows something mounted on `/`.
pub fn lsblk_shows_root(listing: &str) -> bool {
    listing.split_whitespace().any(|token| token == "/")
}

/// Finds the first process whose command line mentions `program`, skipping init.
pub fn find_process_id(ps_listing: &str, program: &str) -> Option<u32> {
    ps_listing.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let pid = tokens.first()?.parse::<u32>().ok()?;
        (tokens.len() > 1 && pid != 1 && tokens.contains(&program)).then_some(pid)
    })
}

/// The interactive `/bin/sh -i` the initramfs drops into after a failed unlock.
pub fn find_emergency_shell(ps_listing: &str) -> Option<u32> {
    ps_listing.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let pid = tokens.first()?.parse::<u32>().ok()?;
        let interactive = tokens
            .windows(2)
            .any(|pair| pair[0] == "/bin/sh" && pair[1] == "-i");
        (pid != 1 && interactive).then_some(pid)
    })
}
