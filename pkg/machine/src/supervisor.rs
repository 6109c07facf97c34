//! Hypervisor process tracking.
//!
//! The launch record (`hyperkit.json`) written by the privileged launch path is
//! the only durable evidence that a hypervisor was started. Everything read
//! from it is re-verified against the OS process table before it is believed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use pkg_constants::paths::{LAUNCH_RECORD_FILENAME, LOCK_FILENAME};
use pkg_constants::vm::HYPERVISOR_SIGNATURE;

use crate::error::MachineError;

/// Lifecycle state as observed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Stopped,
    Running,
    /// The state could not be determined.
    Error,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Stopped => write!(f, "Stopped"),
            MachineState::Running => write!(f, "Running"),
            MachineState::Error => write!(f, "Error"),
        }
    }
}

/// Contents of `hyperkit.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub pid: u32,
    pub hyperkit: PathBuf,
    pub uuid: String,
    #[serde(default)]
    pub argv: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl LaunchRecord {
    /// Write the record into `machine_dir` via a temp file and rename, so a
    /// reader never observes a half-written record.
    pub fn write_atomic(&self, machine_dir: &Path) -> Result<()> {
        let path = machine_dir.join(LAUNCH_RECORD_FILENAME);
        let mut tmp = tempfile::Builder::new()
            .prefix(".hyperkit.json.")
            .tempfile_in(machine_dir)
            .with_context(|| format!("failed to create a temp file in {}", machine_dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(&path)
            .with_context(|| format!("failed to persist {}", path.display()))?;
        Ok(())
    }
}

/// Tracks the hypervisor process of one machine directory.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    machine_dir: PathBuf,
    signature: String,
}

impl ProcessSupervisor {
    pub fn new(machine_dir: &Path) -> Self {
        Self::with_signature(machine_dir, HYPERVISOR_SIGNATURE)
    }

    /// A supervisor that accepts processes whose name contains `signature`.
    pub fn with_signature(machine_dir: &Path, signature: &str) -> Self {
        Self {
            machine_dir: machine_dir.to_path_buf(),
            signature: signature.to_string(),
        }
    }

    pub fn machine_dir(&self) -> &Path {
        &self.machine_dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.machine_dir.join(LAUNCH_RECORD_FILENAME)
    }

    /// Read the launch record.
    ///
    /// A missing file is `None`. An unparseable one is logged and also `None`:
    /// it cannot describe a live process we could do anything about.
    pub fn load_record(&self) -> Result<Option<LaunchRecord>> {
        let path = self.record_path();
        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        match serde_json::from_slice::<LaunchRecord>(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), "ignoring malformed launch record: {}", e);
                Ok(None)
            }
        }
    }

    /// The stored process identifier, 0 when there is none.
    pub fn read_pid(&self) -> Result<u32> {
        Ok(self.load_record()?.map(|r| r.pid).unwrap_or(0))
    }

    /// Classify `pid` against the live process table.
    ///
    /// Only a live, non-zombie process whose name contains the hypervisor
    /// signature counts as `Running`. Anything else is a stale identifier.
    pub fn pid_state(&self, pid: u32) -> MachineState {
        if pid == 0 {
            return MachineState::Stopped;
        }

        let sys_pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let Some(process) = sys.process(sys_pid) else {
            debug!(pid, "process not found");
            return MachineState::Stopped;
        };
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            debug!(pid, "process is defunct");
            return MachineState::Stopped;
        }

        let name = process.name().to_string_lossy();
        if !name.contains(&self.signature) {
            debug!(pid, name = %name, "pid belongs to an unrelated process");
            return MachineState::Stopped;
        }
        MachineState::Running
    }

    /// Current state of the machine.
    pub fn state(&self) -> Result<MachineState> {
        let pid = self.read_pid()?;
        Ok(self.pid_state(pid))
    }

    /// The recorded pid, if it still names a live hypervisor.
    pub fn running_pid(&self) -> Result<Option<u32>> {
        let pid = self.read_pid()?;
        Ok((self.pid_state(pid) == MachineState::Running).then_some(pid))
    }

    /// Reconcile a launch record left behind by a previous run.
    ///
    /// No record is a clean start. A record naming a live hypervisor aborts
    /// with `AlreadyRunning`. Anything else is stale and is deleted.
    pub fn recover_from_unclean_shutdown(&self) -> Result<()> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(());
        }

        let pid = self.read_pid()?;
        if self.pid_state(pid) == MachineState::Running {
            return Err(MachineError::AlreadyRunning { pid }.into());
        }

        info!(pid, path = %path.display(), "removing stale launch record");
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

/// Exclusive advisory lock on a machine directory. Released on drop.
#[derive(Debug)]
pub struct MachineLock {
    _file: File,
}

impl MachineLock {
    /// Take the lock without waiting. A held lock is `Busy`.
    pub fn try_acquire(machine_dir: &Path) -> Result<Self> {
        let path = machine_dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(MachineError::Busy(machine_dir.to_path_buf()).into());
            }
            return Err(e).with_context(|| format!("failed to lock {}", path.display()));
        }
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_kind;
    use std::process::{Child, Command};

    fn spawn_sleep() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    fn record_for(pid: u32) -> LaunchRecord {
        LaunchRecord {
            pid,
            hyperkit: PathBuf::from("/usr/local/bin/hyperkit"),
            uuid: "c3b2c1a0-0000-0000-0000-000000000000".into(),
            argv: vec![],
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_write_ignores_planted_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::write(&victim, "untouched").unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("hyperkit.json.tmp")).unwrap();

        let record = record_for(42);
        record.write_atomic(dir.path()).unwrap();

        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "untouched");
        let read: LaunchRecord =
            serde_json::from_slice(&std::fs::read(dir.path().join(LAUNCH_RECORD_FILENAME)).unwrap())
                .unwrap();
        assert_eq!(read, record);
    }

    #[test]
    fn test_missing_record_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(dir.path());
        assert_eq!(sup.read_pid().unwrap(), 0);
        assert_eq!(sup.state().unwrap(), MachineState::Stopped);
    }

    #[test]
    fn test_malformed_record_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LAUNCH_RECORD_FILENAME), "not json").unwrap();
        let sup = ProcessSupervisor::new(dir.path());
        assert_eq!(sup.read_pid().unwrap(), 0);
    }

    #[test]
    fn test_live_process_with_matching_name_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_sleep();
        record_for(child.id()).write_atomic(dir.path()).unwrap();

        let sup = ProcessSupervisor::with_signature(dir.path(), "sleep");
        assert_eq!(sup.state().unwrap(), MachineState::Running);
        assert_eq!(sup.running_pid().unwrap(), Some(child.id()));

        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(sup.state().unwrap(), MachineState::Stopped);
    }

    #[test]
    fn test_reused_pid_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_sleep();
        record_for(child.id()).write_atomic(dir.path()).unwrap();

        // `sleep` is alive but is not a hypervisor.
        let sup = ProcessSupervisor::new(dir.path());
        assert_eq!(sup.state().unwrap(), MachineState::Stopped);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_recovery_without_record_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        ProcessSupervisor::new(dir.path())
            .recover_from_unclean_shutdown()
            .unwrap();
    }

    #[test]
    fn test_recovery_deletes_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_sleep();
        record_for(child.id()).write_atomic(dir.path()).unwrap();

        let sup = ProcessSupervisor::new(dir.path());
        sup.recover_from_unclean_shutdown().unwrap();
        assert!(!sup.record_path().exists());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_recovery_refuses_live_hypervisor() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_sleep();
        record_for(child.id()).write_atomic(dir.path()).unwrap();

        let sup = ProcessSupervisor::with_signature(dir.path(), "sleep");
        let err = sup.recover_from_unclean_shutdown().unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, MachineError::AlreadyRunning { .. })));
        assert!(sup.record_path().exists());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let held = MachineLock::try_acquire(dir.path()).unwrap();

        let err = MachineLock::try_acquire(dir.path()).unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, MachineError::Busy(_))));

        drop(held);
        MachineLock::try_acquire(dir.path()).unwrap();
    }
}
