//! Virtual machine / guest constants.

/// Name of the hypervisor executable.
pub const HYPERVISOR_NAME: &str = "hyperkit";

/// Fragment every legitimate hypervisor process name contains
/// (`hyperkit`, `com.docker.hyperkit`).
pub const HYPERVISOR_SIGNATURE: &str = "hyper";

/// CPU count below or at which the hypervisor's own default applies.
pub const DEFAULT_CPU_COUNT: u32 = 1;

/// Memory (MB) below or at which the hypervisor's own default applies.
pub const DEFAULT_MEMORY_MB: u64 = 1024;

/// Default disk size in (decimal) megabytes.
pub const DEFAULT_DISK_SIZE_MB: u64 = 20000;

/// Bytes per disk megabyte (decimal).
pub const DISK_BYTES_PER_MB: u64 = 1_000_000;

/// Default guest login user.
pub const DEFAULT_SSH_USER: &str = "docker";

/// Default kernel command line for boot2docker-style images.
///
/// `noembed` keeps TinyCoreLinux from running out of ramdisk before
/// `pivot_root`.
pub const DEFAULT_CMDLINE: &str = "loglevel=3 console=ttyS0 console=tty0 noembed nomodeset norestore random.trust_cpu=on hw_rng_model=virtio base";

/// Guest directory under which shares without an explicit mount point land.
pub const DEFAULT_NFS_SHARES_ROOT: &str = "/nfsshares";

/// Magic entry name that makes boot2docker format its data disk.
pub const SEED_DISK_MAGIC: &str = "boot2docker, please format-me";

/// vsock context id given to the guest.
pub const GUEST_VSOCK_CID: u32 = 3;

/// Graceful-stop polling: attempts and interval (seconds).
pub const STOP_POLL_ATTEMPTS: u32 = 5;
pub const STOP_POLL_INTERVAL_SECS: u64 = 1;
