//! Lifecycle of one machine: Create, Start, Stop, Kill, Remove, Restart and
//! GetState.
//!
//! The controller runs unprivileged. Launching hyperkit, signalling it,
//! mapping its UUID to a MAC and editing the export table all go through the
//! [`PrivilegeBroker`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::unistd::{User, getuid};
use tracing::{debug, info, warn};

use pkg_constants::network::{
    ADDRESS_POLL_ATTEMPTS, ADDRESS_POLL_INTERVAL_SECS, SSH_WAIT_ATTEMPTS, SSH_WAIT_INTERVAL_SECS,
};
use pkg_constants::paths::{BOOT_IMAGE_FILENAME, DHCPD_LEASES_FILE};
use pkg_constants::vm::{STOP_POLL_ATTEMPTS, STOP_POLL_INTERVAL_SECS};

use crate::config::MachineConfig;
use crate::error::MachineError;
use crate::exports::{ExportEntry, export_identifier};
use crate::guest::{GuestConnector, MountSpec, SshConnector, mount_script};
use crate::hyperkit::{self, Disk, HypervisorConfig};
use crate::network::{self, PollBudget};
use crate::privilege::{HypervisorSignal, PrivilegeBroker, SelfInvoker};
use crate::provision::BootImageProvisioner;
use crate::supervisor::{MachineLock, MachineState, ProcessSupervisor};

/// Poll budgets used by Start and Stop.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub address: PollBudget,
    pub stop_attempts: u32,
    pub stop_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            address: PollBudget {
                attempts: ADDRESS_POLL_ATTEMPTS,
                interval: Duration::from_secs(ADDRESS_POLL_INTERVAL_SECS),
            },
            stop_attempts: STOP_POLL_ATTEMPTS,
            stop_interval: Duration::from_secs(STOP_POLL_INTERVAL_SECS),
        }
    }
}

/// What is known about the machine right now. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub pid: u32,
    pub ip: Option<String>,
    pub state: MachineState,
}

pub struct LifecycleController {
    config: MachineConfig,
    broker: Arc<dyn PrivilegeBroker>,
    guests: Arc<dyn GuestConnector>,
    supervisor: ProcessSupervisor,
    timings: Timings,
    leases_file: PathBuf,
    ip: Option<String>,
}

impl LifecycleController {
    pub fn new(
        config: MachineConfig,
        broker: Arc<dyn PrivilegeBroker>,
        guests: Arc<dyn GuestConnector>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(&config.machine_dir());
        Self {
            config,
            broker,
            guests,
            supervisor,
            timings: Timings::default(),
            leases_file: PathBuf::from(DHCPD_LEASES_FILE),
            ip: None,
        }
    }

    /// Controller wired to the real privileged side and SSH.
    pub fn system(config: MachineConfig) -> Result<Self> {
        let broker = Arc::new(SelfInvoker::current()?);
        let guests = Arc::new(SshConnector {
            attempts: SSH_WAIT_ATTEMPTS,
            interval: Duration::from_secs(SSH_WAIT_INTERVAL_SECS),
        });
        Ok(Self::new(config, broker, guests))
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_leases_file(mut self, path: PathBuf) -> Self {
        self.leases_file = path;
        self
    }

    /// Accept hypervisor processes whose name contains `signature`.
    pub fn with_process_signature(mut self, signature: &str) -> Self {
        self.supervisor = ProcessSupervisor::with_signature(&self.config.machine_dir(), signature);
        self
    }

    /// Address resolved by the last successful Start.
    pub fn with_known_ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    // ── Create ────────────────────────────────────────────────────────

    /// Provision the disk and boot artifacts, then Start.
    pub async fn create(&mut self) -> Result<()> {
        self.config.validate()?;

        let disk = self.config.disk_path();
        if disk.exists() {
            return Err(MachineError::DiskExists(disk).into());
        }

        let artifacts = BootImageProvisioner::new(&self.config)
            .provision()
            .await
            .context("making disk image")?;
        self.config.boot_kernel = Some(artifacts.kernel);
        self.config.boot_initrd = Some(artifacts.initrd);

        self.start().await
    }

    // ── Start ─────────────────────────────────────────────────────────

    pub async fn start(&mut self) -> Result<()> {
        self.config.validate()?;
        let machine_dir = self.config.machine_dir();
        let _lock = MachineLock::try_acquire(&machine_dir)?;

        self.supervisor.recover_from_unclean_shutdown()?;

        let hyperkit = match &self.config.hyperkit {
            Some(path) => path.clone(),
            None => hyperkit::find_hyperkit(hyperkit::driver_dir().as_deref())
                .ok_or_else(|| anyhow::anyhow!("hyperkit not found in the driver directory or PATH"))?,
        };
        let boot_iso = self.config.resolve(BOOT_IMAGE_FILENAME);
        let hv = HypervisorConfig::from_machine(&self.config, &hyperkit, &boot_iso)?;
        debug!(uuid = %hv.uuid, "Using UUID");

        let mac = self
            .broker
            .hardware_address(hv.uuid.clone(), Some(hyperkit.clone()))
            .await
            .context("getting MAC address from UUID")?;
        let mac = network::trim_mac(&mac);
        debug!(mac = %mac, "Generated MAC");

        let disks = vec![Disk::Raw {
            path: self.config.disk_path(),
            size_mb: self.config.disk_size_mb,
        }];
        let cmdline = self.config.cmdline.clone();
        self.broker
            .launch_hypervisor(hv, disks, cmdline.clone())
            .await
            .with_context(|| format!("failed to start hyperkit with cmd line: {}", cmdline))?;

        let supervisor = &self.supervisor;
        let leases = &self.leases_file;
        let ip = network::resolve_ip(
            || network::lookup_ip(leases, &mac),
            || supervisor.state(),
            self.timings.address,
            &cmdline,
        )
        .await?;
        info!(machine = %self.config.machine_name, ip = %ip, "machine started");
        self.ip = Some(ip.clone());

        if !self.config.shares.is_empty() {
            info!("Setting up NFS mounts");
            self.setup_shares(&ip).await.inspect_err(|e| {
                warn!("NFS setup failed: {:#}", e);
            })?;
        }
        Ok(())
    }

    /// Export every share to the guest and mount them inside it.
    ///
    /// Exports already added stay in place if a later step fails; Stop
    /// removes them.
    async fn setup_shares(&self, guest_ip: &str) -> Result<()> {
        let guest = self
            .guests
            .connect(guest_ip, &self.config.ssh_user, &self.config.ssh_key_path());
        guest.wait_ready().await?;

        let host_ip = network::host_address(guest_ip).await?;
        let machine_dir = self.config.machine_dir();

        let mut entries = Vec::new();
        let mut mounts = Vec::new();
        for share in self.config.share_specs()? {
            let resolved = share.resolve_host_path(&machine_dir)?;
            mounts.push(MountSpec {
                host_path: resolved.to_string_lossy().to_string(),
                mount_point: share.guest_mount_point(&self.config.nfs_shares_root, &resolved),
            });
            entries.push(ExportEntry {
                identifier: export_identifier(&self.config.machine_name, &share.raw),
                path: resolved,
                client_ip: guest_ip.to_string(),
            });
        }

        let skipped = self
            .broker
            .add_exports(invoking_user()?, entries)
            .await
            .context("adding NFS exports")?;
        for line in &skipped {
            warn!("skipped conflicting share: {}", line);
        }

        let script = mount_script(&host_ip, &mounts);
        debug!("mount script:\n{}", script);
        guest.run(&script).await.context("mounting NFS shares")?;
        Ok(())
    }

    // ── Stop / Kill ───────────────────────────────────────────────────

    /// Remove this machine's exports. Problems come back as warnings.
    pub async fn remove_exports(&self) -> Vec<String> {
        if self.config.shares.is_empty() {
            return Vec::new();
        }
        let identifiers = self
            .config
            .shares
            .iter()
            .map(|share| export_identifier(&self.config.machine_name, share))
            .collect();
        match self.broker.remove_exports(identifiers).await {
            Ok(warnings) => warnings,
            Err(e) => vec![format!("removing NFS exports: {:#}", e)],
        }
    }

    /// Terminate gracefully, escalating to Kill after the stop budget.
    pub async fn stop(&mut self) -> Result<()> {
        for warning in self.remove_exports().await {
            warn!("{}", warning);
        }

        self.broker
            .signal_hypervisor(self.config.machine_dir(), HypervisorSignal::Terminate)
            .await
            .context("hyperkit sigterm failed")?;

        for _ in 0..self.timings.stop_attempts {
            debug!("waiting for graceful shutdown");
            tokio::time::sleep(self.timings.stop_interval).await;
            let state = self
                .get_state()
                .context("hyperkit waiting graceful shutdown failed")?;
            if state == MachineState::Stopped {
                self.ip = None;
                return Ok(());
            }
        }

        debug!("sending sigkill");
        self.kill().await
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.broker
            .signal_hypervisor(self.config.machine_dir(), HypervisorSignal::Kill)
            .await
            .context("hyperkit sigkill failed")?;
        self.ip = None;
        Ok(())
    }

    // ── Remove / Restart ──────────────────────────────────────────────

    /// Stop the machine if it is running. Deleting its files is up to the caller.
    pub async fn remove(&mut self) -> Result<()> {
        match self.get_state() {
            Ok(MachineState::Running) => self.stop().await,
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("Error checking machine status: {:#}, assuming it has been removed already", e);
                Ok(())
            }
        }
    }

    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    // ── State ─────────────────────────────────────────────────────────

    pub fn get_state(&self) -> Result<MachineState> {
        self.supervisor.state()
    }

    pub fn runtime_state(&self) -> RuntimeState {
        let pid = self.supervisor.read_pid().unwrap_or(0);
        let state = match self.get_state() {
            Ok(state) => state,
            Err(e) => {
                debug!("state query failed: {:#}", e);
                MachineState::Error
            }
        };
        RuntimeState {
            pid,
            ip: self.ip.clone(),
            state,
        }
    }
}

/// Login name of the user the driver runs for; falls back to the numeric uid.
fn invoking_user() -> Result<String> {
    let uid = getuid();
    let user = User::from_uid(uid).context("looking up the current user")?;
    Ok(user.map(|u| u.name).unwrap_or_else(|| uid.to_string()))
}
