//! hyperkit invocation.
//!
//! Builds the hypervisor command line from a [`HypervisorConfig`] and a disk
//! list, and implements the two privileged operations that execute hyperkit:
//! launching the guest and asking it for the MAC address of a UUID.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pkg_constants::network::TRUSTED_GROUP_IDS;
use pkg_constants::paths::{
    CONSOLE_LOG_FILENAME, CONSOLE_TTY_FILENAME, HYPERVISOR_LOG_FILENAME,
};
use pkg_constants::vm::{DEFAULT_CPU_COUNT, DEFAULT_MEMORY_MB, GUEST_VSOCK_CID, HYPERVISOR_NAME};

use crate::config::MachineConfig;
use crate::error::MachineError;
use crate::supervisor::LaunchRecord;

/// How long a freshly spawned hypervisor must survive before it counts as launched.
const LAUNCH_SETTLE: Duration = Duration::from_millis(500);

/// A block device attached to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Disk {
    Raw { path: PathBuf, size_mb: u64 },
    Qcow { path: PathBuf, size_mb: u64 },
}

impl Disk {
    pub fn path(&self) -> &Path {
        match self {
            Disk::Raw { path, .. } | Disk::Qcow { path, .. } => path,
        }
    }

    fn device_arg(&self, slot: u32) -> String {
        match self {
            Disk::Raw { path, .. } => format!("{}:0,virtio-blk,{}", slot, path.display()),
            Disk::Qcow { path, .. } => format!(
                "{}:0,virtio-blk,file://{},format=qcow",
                slot,
                path.display()
            ),
        }
    }
}

/// Everything hyperkit needs except the disks and the kernel command line,
/// which travel as separate arguments of the launch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorConfig {
    pub hyperkit: PathBuf,
    /// Machine directory. Receives the launch record, log and console files.
    pub state_dir: PathBuf,
    pub uuid: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    #[serde(default)]
    pub iso_images: Vec<PathBuf>,
    #[serde(default)]
    pub vsock_ports: Vec<u32>,
    #[serde(default)]
    pub vpnkit_sock: Option<PathBuf>,
}

impl HypervisorConfig {
    /// Derive the launch configuration for `cfg`.
    ///
    /// CPU count and memory only take effect above the hypervisor's own
    /// defaults (1 CPU, 1024 MB).
    pub fn from_machine(cfg: &MachineConfig, hyperkit: &Path, boot_iso: &Path) -> Result<Self> {
        let kernel = cfg
            .boot_kernel
            .clone()
            .ok_or(MachineError::MissingBootArtifact("kernel"))?;
        let initrd = cfg
            .boot_initrd
            .clone()
            .ok_or(MachineError::MissingBootArtifact("initrd"))?;

        Ok(Self {
            hyperkit: hyperkit.to_path_buf(),
            state_dir: cfg.machine_dir(),
            uuid: cfg.machine_uuid().to_string(),
            cpus: cfg.cpus.max(DEFAULT_CPU_COUNT),
            memory_mb: cfg.memory_mb.max(DEFAULT_MEMORY_MB),
            kernel,
            initrd,
            iso_images: vec![boot_iso.to_path_buf()],
            vsock_ports: cfg.vsock_ports.clone(),
            vpnkit_sock: cfg.vpnkit_sock.clone(),
        })
    }

    /// Full hyperkit argument vector.
    pub fn arguments(&self, disks: &[Disk], cmdline: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-A".into(),
            "-u".into(),
            "-c".into(),
            self.cpus.to_string(),
            "-m".into(),
            format!("{}M", self.memory_mb),
            "-s".into(),
            "0:0,hostbridge".into(),
            "-s".into(),
            "31,lpc".into(),
        ];

        args.push("-s".into());
        match &self.vpnkit_sock {
            Some(sock) => args.push(format!("1:0,virtio-vpnkit,path={}", sock.display())),
            None => args.push("1:0,virtio-net".into()),
        }
        args.push("-U".into());
        args.push(self.uuid.clone());

        let mut slot = 2;
        for disk in disks {
            args.push("-s".into());
            args.push(disk.device_arg(slot));
            slot += 1;
        }
        for iso in &self.iso_images {
            args.push("-s".into());
            args.push(format!("{},ahci-cd,{}", slot, iso.display()));
            slot += 1;
        }
        if !self.vsock_ports.is_empty() {
            let forwards: Vec<String> = self.vsock_ports.iter().map(|p| p.to_string()).collect();
            args.push("-s".into());
            args.push(format!(
                "{},virtio-sock,guest_cid={},path={},guest_forwards={}",
                slot,
                GUEST_VSOCK_CID,
                self.state_dir.display(),
                forwards.join(";")
            ));
            slot += 1;
        }
        args.push("-s".into());
        args.push(format!("{},virtio-rnd", slot));

        args.push("-l".into());
        args.push(format!(
            "com1,autopty={},log={}",
            self.state_dir.join(CONSOLE_TTY_FILENAME).display(),
            self.state_dir.join(CONSOLE_LOG_FILENAME).display()
        ));
        args.push("-f".into());
        args.push(format!(
            "kexec,{},{},{}",
            self.kernel.display(),
            self.initrd.display(),
            cmdline
        ));
        args
    }
}

/// Locate the hypervisor: next to the driver executable, then in PATH.
pub fn find_hyperkit(driver_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = driver_dir {
        let candidate = dir.join(HYPERVISOR_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(HYPERVISOR_NAME))
        .find(|candidate| candidate.is_file())
}

/// Directory holding the running executable.
pub fn driver_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Refuse executables the privileged side must not run.
///
/// When `<driver_dir>/hyperkit` exists it is the only permitted binary.
/// Otherwise the binary must be owned by root or by the wheel/admin group.
pub fn verify_executable(path: &Path, driver_dir: Option<&Path>) -> Result<()> {
    let untrusted = |reason: String| MachineError::UntrustedExecutable {
        path: path.to_path_buf(),
        reason,
    };

    if let Some(dir) = driver_dir {
        let approved = dir.join(HYPERVISOR_NAME);
        if approved.exists() && path != approved {
            return Err(untrusted(format!(
                "only {} may be invoked",
                approved.display()
            ))
            .into());
        }
    }

    let meta = std::fs::metadata(path).map_err(|e| untrusted(format!("cannot stat: {}", e)))?;
    check_owner(meta.uid(), meta.gid()).map_err(untrusted)?;
    Ok(())
}

fn check_owner(uid: u32, gid: u32) -> std::result::Result<(), String> {
    if uid == 0 || TRUSTED_GROUP_IDS.contains(&gid) {
        return Ok(());
    }
    Err(format!(
        "must be owned by root, or have group ownership by wheel(0) or admin(80) (uid={}, gid={})",
        uid, gid
    ))
}

/// Start hyperkit detached from this process and record it.
///
/// Runs on the privileged side. The child gets its own process group so it
/// outlives the short-lived launcher, and its output goes to `hyperkit.log`.
pub fn launch(config: &HypervisorConfig, disks: &[Disk], cmdline: &str) -> Result<LaunchRecord> {
    if !config.state_dir.is_dir() {
        anyhow::bail!("state directory {} does not exist", config.state_dir.display());
    }
    for (kind, path) in [("kernel", &config.kernel), ("initrd", &config.initrd)] {
        if !path.is_file() {
            anyhow::bail!("{} {} does not exist", kind, path.display());
        }
    }
    verify_executable(&config.hyperkit, driver_dir().as_deref())?;

    let argv = config.arguments(disks, cmdline);
    debug!(hyperkit = %config.hyperkit.display(), "launch argv: {}", argv.join(" "));

    let log_path = config.state_dir.join(HYPERVISOR_LOG_FILENAME);
    let log_file = open_log(&log_path)?;
    let stderr_file = log_file.try_clone()?;
    let mut log_reader = log_file.try_clone()?;

    let mut child = Command::new(&config.hyperkit)
        .args(&argv)
        .current_dir(&config.state_dir)
        .stdin(Stdio::null())
        .stdout(log_file)
        .stderr(stderr_file)
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed to spawn {}", config.hyperkit.display()))?;

    std::thread::sleep(LAUNCH_SETTLE);
    if let Some(status) = child.try_wait()? {
        let mut log = String::new();
        let _ = log_reader
            .seek(SeekFrom::Start(0))
            .and_then(|_| log_reader.read_to_string(&mut log));
        anyhow::bail!("hyperkit exited immediately ({}):\n{}", status, log.trim());
    }

    let record = LaunchRecord {
        pid: child.id(),
        hyperkit: config.hyperkit.clone(),
        uuid: config.uuid.clone(),
        argv,
        started_at: Utc::now(),
    };
    record.write_atomic(&config.state_dir)?;
    info!(pid = record.pid, uuid = %record.uuid, "[hyperkit] started");
    Ok(record)
}

/// Open the hypervisor log for appending. A symlink in its place is refused.
fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Ask hyperkit which MAC address vmnet assigns to `uuid`.
pub fn hardware_address(hyperkit: &Path, uuid: &str) -> Result<String> {
    verify_executable(hyperkit, driver_dir().as_deref())?;

    let output = Command::new(hyperkit)
        .args([
            "-A",
            "-u",
            "-s",
            "0:0,hostbridge",
            "-s",
            "31,lpc",
            "-s",
            "1:0,virtio-net",
            "-U",
            uuid,
            "-M",
            "-f",
            "kexec,/dev/null,/dev/null,",
        ])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {}", hyperkit.display()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_mac_output(&stdout).ok_or_else(|| {
        anyhow::anyhow!(
            "no MAC address reported for uuid {} ({}): {}",
            uuid,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    })
}

/// Extract the address from hyperkit's `MAC: xx:xx:xx:xx:xx:xx` line.
fn parse_mac_output(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("MAC:"))
        .map(|mac| mac.trim().to_string())
        .filter(|mac| mac.split(':').count() == 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HypervisorConfig {
        HypervisorConfig {
            hyperkit: PathBuf::from("/usr/local/bin/hyperkit"),
            state_dir: PathBuf::from("/m"),
            uuid: "2996454b-06a7-4c9b-8c5c-00d2d0ac6c4a".into(),
            cpus: 2,
            memory_mb: 2048,
            kernel: PathBuf::from("/m/bzimage"),
            initrd: PathBuf::from("/m/initrd"),
            iso_images: vec![PathBuf::from("/m/boot2docker.iso")],
            vsock_ports: vec![],
            vpnkit_sock: None,
        }
    }

    #[test]
    fn test_log_refuses_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::write(&victim, "secret\n").unwrap();
        let log = dir.path().join(HYPERVISOR_LOG_FILENAME);
        std::os::unix::fs::symlink(&victim, &log).unwrap();

        assert!(open_log(&log).is_err());
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "secret\n");

        std::fs::remove_file(&log).unwrap();
        open_log(&log).unwrap();
        assert!(log.is_file());
    }

    #[test]
    fn test_arguments_layout() {
        let disks = [Disk::Raw {
            path: PathBuf::from("/m/m.rawdisk"),
            size_mb: 20000,
        }];
        let args = config().arguments(&disks, "console=ttyS0");
        let line = args.join(" ");

        assert!(line.starts_with("-A -u -c 2 -m 2048M -s 0:0,hostbridge -s 31,lpc"));
        assert!(line.contains("-s 1:0,virtio-net -U 2996454b-06a7-4c9b-8c5c-00d2d0ac6c4a"));
        assert!(line.contains("-s 2:0,virtio-blk,/m/m.rawdisk"));
        assert!(line.contains("-s 3,ahci-cd,/m/boot2docker.iso"));
        assert!(line.contains("-s 4,virtio-rnd"));
        assert!(line.contains("-l com1,autopty=/m/tty,log=/m/console-ring"));
        assert_eq!(args.last().unwrap(), "kexec,/m/bzimage,/m/initrd,console=ttyS0");
    }

    #[test]
    fn test_arguments_vsock_and_vpnkit() {
        let mut cfg = config();
        cfg.vsock_ports = vec![2376, 2377];
        cfg.vpnkit_sock = Some(PathBuf::from("/tmp/vpnkit.sock"));
        let line = cfg.arguments(&[], "").join(" ");

        assert!(line.contains("-s 1:0,virtio-vpnkit,path=/tmp/vpnkit.sock"));
        assert!(line.contains("-s 3,virtio-sock,guest_cid=3,path=/m,guest_forwards=2376;2377"));
        assert!(line.contains("-s 4,virtio-rnd"));
    }

    #[test]
    fn test_qcow_disk_argument() {
        let disk = Disk::Qcow {
            path: PathBuf::from("/m/d.qcow2"),
            size_mb: 1,
        };
        assert_eq!(disk.device_arg(2), "2:0,virtio-blk,file:///m/d.qcow2,format=qcow");
    }

    #[test]
    fn test_disk_list_is_tagged() {
        let disks = vec![Disk::Raw {
            path: PathBuf::from("/m/m.rawdisk"),
            size_mb: 10,
        }];
        let json = serde_json::to_string(&disks).unwrap();
        assert!(json.contains(r#""type":"raw""#));
        let back: Vec<Disk> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, disks);
    }

    #[test]
    fn test_from_machine_applies_minimums() {
        let mut cfg = MachineConfig::new("dev", Path::new("/store"));
        cfg.cpus = 0;
        cfg.memory_mb = 512;
        cfg.boot_kernel = Some(PathBuf::from("/k"));
        cfg.boot_initrd = Some(PathBuf::from("/i"));
        let h = HypervisorConfig::from_machine(&cfg, Path::new("/hk"), Path::new("/iso")).unwrap();
        assert_eq!(h.cpus, 1);
        assert_eq!(h.memory_mb, 1024);
        assert_eq!(h.uuid, cfg.machine_uuid().to_string());

        cfg.cpus = 4;
        cfg.memory_mb = 8192;
        let h = HypervisorConfig::from_machine(&cfg, Path::new("/hk"), Path::new("/iso")).unwrap();
        assert_eq!((h.cpus, h.memory_mb), (4, 8192));
    }

    #[test]
    fn test_from_machine_requires_boot_artifacts() {
        let cfg = MachineConfig::new("dev", Path::new("/store"));
        let err = HypervisorConfig::from_machine(&cfg, Path::new("/hk"), Path::new("/iso"))
            .unwrap_err();
        assert!(err.to_string().contains("kernel"));
    }

    #[test]
    fn test_check_owner() {
        assert!(check_owner(0, 20).is_ok());
        assert!(check_owner(501, 0).is_ok());
        assert!(check_owner(501, 80).is_ok());
        assert!(check_owner(501, 20).is_err());
    }

    #[test]
    fn test_allow_list_rejects_other_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hyperkit"), "").unwrap();
        let err = verify_executable(Path::new("/bin/sh"), Some(dir.path())).unwrap_err();
        assert!(err.to_string().contains("only"));
    }

    #[test]
    fn test_parse_mac_output() {
        assert_eq!(
            parse_mac_output("MAC: 0a:1b:2c:3d:4e:5f\n").as_deref(),
            Some("0a:1b:2c:3d:4e:5f")
        );
        assert_eq!(parse_mac_output("hyperkit: error\n"), None);
    }

    #[test]
    fn test_find_hyperkit_prefers_driver_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("hyperkit");
        std::fs::write(&bin, "").unwrap();
        assert_eq!(find_hyperkit(Some(dir.path())), Some(bin));
    }
}
