//! Machine configuration.
//!
//! `MachineConfig` is created once by `create` and persisted by the caller as
//! `config.json` in the machine directory. Only the boot artifact paths are
//! filled in afterwards (by provisioning).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pkg_constants::paths::{MACHINES_DIR, SSH_KEY_FILENAME};
use pkg_constants::vm::{
    DEFAULT_CMDLINE, DEFAULT_CPU_COUNT, DEFAULT_DISK_SIZE_MB, DEFAULT_MEMORY_MB,
    DEFAULT_NFS_SHARES_ROOT, DEFAULT_SSH_USER,
};

use crate::error::MachineError;

/// Declarative description of one guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub machine_name: String,
    pub storage_path: PathBuf,
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_size_mb: u64,
    /// URL or path of the boot image. Empty means "use the cached image".
    #[serde(default)]
    pub boot_image: String,
    pub cmdline: String,
    /// `hostPath[:guestMountPoint]` entries exported over NFS.
    #[serde(default)]
    pub shares: Vec<String>,
    #[serde(default = "default_shares_root")]
    pub nfs_shares_root: String,
    #[serde(default)]
    pub vsock_ports: Vec<u32>,
    /// Explicit hardware identifier. Derived from the machine directory if unset.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Hypervisor executable. Looked up next to the driver, then in PATH, if unset.
    #[serde(default)]
    pub hyperkit: Option<PathBuf>,
    #[serde(default)]
    pub vpnkit_sock: Option<PathBuf>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub boot_kernel: Option<PathBuf>,
    #[serde(default)]
    pub boot_initrd: Option<PathBuf>,
}

fn default_shares_root() -> String {
    DEFAULT_NFS_SHARES_ROOT.to_string()
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

impl MachineConfig {
    /// A config with the built-in defaults for `machine_name` under `storage_path`.
    pub fn new(machine_name: &str, storage_path: &Path) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            storage_path: storage_path.to_path_buf(),
            cpus: DEFAULT_CPU_COUNT,
            memory_mb: DEFAULT_MEMORY_MB,
            disk_size_mb: DEFAULT_DISK_SIZE_MB,
            boot_image: String::new(),
            cmdline: DEFAULT_CMDLINE.to_string(),
            shares: Vec::new(),
            nfs_shares_root: default_shares_root(),
            vsock_ports: Vec::new(),
            uuid: None,
            hyperkit: None,
            vpnkit_sock: None,
            ssh_user: default_ssh_user(),
            boot_kernel: None,
            boot_initrd: None,
        }
    }

    /// The machine's private directory.
    pub fn machine_dir(&self) -> PathBuf {
        self.storage_path.join(MACHINES_DIR).join(&self.machine_name)
    }

    /// Path of `name` inside the machine directory.
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.machine_dir().join(name)
    }

    pub fn disk_path(&self) -> PathBuf {
        self.resolve(&format!("{}.rawdisk", self.machine_name))
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.resolve(SSH_KEY_FILENAME)
    }

    /// The UUID handed to the hypervisor, which determines the MAC address.
    ///
    /// Without an explicit value this is a name-based UUID of the machine
    /// directory, so it is stable for the life of the machine.
    pub fn machine_uuid(&self) -> Uuid {
        self.uuid.unwrap_or_else(|| {
            Uuid::new_v5(
                &Uuid::nil(),
                self.machine_dir().to_string_lossy().as_bytes(),
            )
        })
    }

    /// Parsed share specifications.
    pub fn share_specs(&self) -> Result<Vec<ShareSpec>> {
        self.shares.iter().map(|s| ShareSpec::parse(s)).collect()
    }

    /// Reject configurations that can never start.
    pub fn validate(&self) -> Result<()> {
        if self.machine_name.is_empty() || self.machine_name.contains('/') {
            anyhow::bail!("invalid machine name '{}'", self.machine_name);
        }
        if let Some(port) = self.vsock_ports.iter().find(|p| **p == 0) {
            return Err(MachineError::InvalidVsockPort(port.to_string()).into());
        }
        self.share_specs()?;
        Ok(())
    }
}

/// One `hostPath[:guestMountPoint]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSpec {
    /// The entry exactly as configured. Export identifiers are built from this.
    pub raw: String,
    pub host_path: String,
    pub mount_point: Option<String>,
}

impl ShareSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| MachineError::InvalidShare {
            share: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = raw.split(':');
        let host_path = parts.next().unwrap_or_default();
        let mount_point = parts.next();
        if parts.next().is_some() {
            return Err(invalid("expected hostPath[:guestMountPoint]").into());
        }
        if host_path.is_empty() {
            return Err(invalid("host path is empty").into());
        }
        if let Some(mp) = mount_point
            && !mp.starts_with('/')
        {
            return Err(invalid("guest mount point must be absolute").into());
        }

        Ok(Self {
            raw: raw.to_string(),
            host_path: host_path.to_string(),
            mount_point: mount_point.map(str::to_string),
        })
    }

    /// Absolute, symlink-free host path. Relative paths are taken relative to
    /// the machine directory.
    pub fn resolve_host_path(&self, machine_dir: &Path) -> Result<PathBuf> {
        let path = Path::new(&self.host_path);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            machine_dir.join(path)
        };
        std::fs::canonicalize(&path)
            .with_context(|| format!("cannot evaluate symlinks in share path '{}'", self.host_path))
    }

    /// Where the guest mounts this share.
    pub fn guest_mount_point(&self, shares_root: &str, resolved: &Path) -> String {
        match &self.mount_point {
            Some(mp) => mp.clone(),
            None => format!("{}{}", shares_root.trim_end_matches('/'), resolved.display()),
        }
    }
}

/// Kernel command line for a user-supplied value.
///
/// A value starting with `+` is appended to the default instead of replacing it.
pub fn resolve_cmdline(user: Option<&str>) -> String {
    match user {
        None | Some("") => DEFAULT_CMDLINE.to_string(),
        Some(extra) if extra.starts_with('+') => format!("{} {}", DEFAULT_CMDLINE, &extra[1..]),
        Some(cmdline) => cmdline.to_string(),
    }
}

/// Driver defaults file (YAML), e.g. `~/.hyperkit/config.yaml`:
/// ```yaml
/// cpus: 2
/// memory: 4096
/// disk-size: 40000
/// iso-url: https://example.com/boot2docker.iso
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfigFile {
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default, alias = "disk-size")]
    pub disk_size: Option<u64>,
    #[serde(default, alias = "iso-url")]
    pub iso_url: Option<String>,
    #[serde(default)]
    pub hyperkit: Option<PathBuf>,
    #[serde(default, alias = "boot-options")]
    pub boot_options: Option<String>,
    #[serde(default, alias = "mount-root")]
    pub mount_root: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
