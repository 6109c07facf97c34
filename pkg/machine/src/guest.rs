//! Running commands inside the guest.
//!
//! The driver has no agent in the guest; it only needs to run one generated
//! shell script over SSH to mount the NFS shares.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use pkg_constants::network::{DEFAULT_SSH_PORT, NFS_MOUNT_OPTIONS};

#[async_trait]
pub trait GuestShell: Send + Sync {
    /// Block until the guest accepts commands.
    async fn wait_ready(&self) -> Result<()>;

    /// Run `command` in the guest and return its output.
    async fn run(&self, command: &str) -> Result<String>;
}

/// `ssh` into the guest with the machine's private key.
pub struct SshGuest {
    pub ip: String,
    pub user: String,
    pub key: PathBuf,
    pub attempts: u32,
    pub interval: Duration,
}

impl SshGuest {
    fn command(&self, remote: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args([
            "-F",
            "/dev/null",
            "-o",
            "IdentitiesOnly=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=quiet",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "ConnectTimeout=10",
            "-i",
        ])
        .arg(&self.key)
        .arg("-p")
        .arg(DEFAULT_SSH_PORT.to_string())
        .arg(format!("{}@{}", self.user, self.ip))
        .arg(remote);
        cmd
    }
}

#[async_trait]
impl GuestShell for SshGuest {
    async fn wait_ready(&self) -> Result<()> {
        for attempt in 1..=self.attempts {
            let status = self.command("exit 0").status().await;
            if matches!(status, Ok(s) if s.success()) {
                return Ok(());
            }
            debug!(attempt, ip = %self.ip, "ssh not ready");
            tokio::time::sleep(self.interval).await;
        }
        anyhow::bail!("Too many retries waiting for SSH to be available at {}", self.ip)
    }

    async fn run(&self, command: &str) -> Result<String> {
        let output = self
            .command(command)
            .output()
            .await
            .context("failed to run ssh")?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            anyhow::bail!(
                "guest command failed ({}): {}{}",
                output.status,
                stdout,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(stdout)
    }
}

/// Opens a [`GuestShell`] once the guest's address is known.
pub trait GuestConnector: Send + Sync {
    fn connect(&self, ip: &str, user: &str, key: &Path) -> Box<dyn GuestShell>;
}

/// Connects with [`SshGuest`].
pub struct SshConnector {
    pub attempts: u32,
    pub interval: Duration,
}

impl GuestConnector for SshConnector {
    fn connect(&self, ip: &str, user: &str, key: &Path) -> Box<dyn GuestShell> {
        Box::new(SshGuest {
            ip: ip.to_string(),
            user: user.to_string(),
            key: key.to_path_buf(),
            attempts: self.attempts,
            interval: self.interval,
        })
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// One share to mount: host path and where it goes in the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: String,
    pub mount_point: String,
}

/// Script that starts the NFS client and mounts every share from `host_ip`.
pub fn mount_script(host_ip: &str, mounts: &[MountSpec]) -> String {
    let mut script =
        String::from("[ -f /usr/local/etc/init.d/nfs-client ] && sudo /usr/local/etc/init.d/nfs-client start\n");
    for m in mounts {
        let mount_point = shell_quote(&m.mount_point);
        script.push_str(&format!("sudo mkdir -p {}\n", mount_point));
        script.push_str(&format!(
            "sudo mount -t nfs -o {} {} {}\n",
            NFS_MOUNT_OPTIONS,
            shell_quote(&format!("{}:{}", host_ip, m.host_path)),
            mount_point
        ));
    }
    script
}
