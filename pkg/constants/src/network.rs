//! Network-related constants.

/// Address resolution: attempts and interval (seconds). ~60s worst case.
pub const ADDRESS_POLL_ATTEMPTS: u32 = 30;
pub const ADDRESS_POLL_INTERVAL_SECS: u64 = 2;

/// SSH reachability: attempts and interval (seconds).
pub const SSH_WAIT_ATTEMPTS: u32 = 60;
pub const SSH_WAIT_INTERVAL_SECS: u64 = 3;

/// Guest SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Prefix of every export identifier written to the host export table.
pub const EXPORT_IDENTIFIER_PREFIX: &str = "docker-machine-driver-hyperkit";

/// Options used by the guest when mounting a share.
pub const NFS_MOUNT_OPTIONS: &str = "vers=3,noacl,async";

/// Group ids allowed to own the hypervisor executable: wheel, admin.
pub const TRUSTED_GROUP_IDS: &[u32] = &[0, 80];
