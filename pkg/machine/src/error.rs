//! Error kinds callers need to tell apart.
//!
//! Operations return `anyhow::Result`; the variants below are raised with
//! `bail!`/`anyhow!` and recovered with `downcast_ref::<MachineError>()`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// Create refuses to overwrite another machine's disk.
    #[error("disk image already exists: {}", .0.display())]
    DiskExists(PathBuf),

    /// A live hypervisor already owns this machine directory.
    #[error("hyperkit is already running for this machine (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// Another invocation holds the machine lock.
    #[error("another operation is in progress on {}", .0.display())]
    Busy(PathBuf),

    /// The guest died while its address was being resolved.
    #[error("hyperkit crashed! command line:\n  hyperkit {cmdline}")]
    HypervisorCrashed { cmdline: String },

    /// The lease table never showed the guest's hardware address.
    #[error("IP address never found in dhcp leases file: {last_error}")]
    AddressNeverFound { last_error: String },

    #[error("failed to extract {0} from boot image")]
    MissingBootArtifact(&'static str),

    #[error("vsock port '{0}' is not a valid port number")]
    InvalidVsockPort(String),

    #[error("invalid share '{share}': {reason}")]
    InvalidShare { share: String, reason: String },

    #[error("export of {} conflicts with existing export: {detail}", .path.display())]
    ExportConflict { path: PathBuf, detail: String },

    #[error("refusing to launch {}: {reason}", .path.display())]
    UntrustedExecutable { path: PathBuf, reason: String },

    /// A privileged sub-operation exited non-zero. `output` is what it printed.
    #[error("{operation} failed: {output}")]
    PrivilegedOperation { operation: String, output: String },

    #[error("invalid privileged request: {0}")]
    InvalidRequest(String),
}

/// Whether `err` (or anything in its chain) is the given kind.
pub fn is_kind(err: &anyhow::Error, matches: impl Fn(&MachineError) -> bool) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<MachineError>())
        .any(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_kind_through_context() {
        let err = anyhow::Error::new(MachineError::Busy(PathBuf::from("/tmp/m")))
            .context("starting machine");
        assert!(is_kind(&err, |e| matches!(e, MachineError::Busy(_))));
        assert!(!is_kind(&err, |e| matches!(e, MachineError::DiskExists(_))));
    }

    #[test]
    fn test_crash_message_carries_cmdline() {
        let err = MachineError::HypervisorCrashed {
            cmdline: "console=ttyS0".into(),
        };
        assert!(err.to_string().contains("hyperkit console=ttyS0"));
    }
}
