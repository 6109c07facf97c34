//! Filesystem path constants.

// ─── Storage layout ───────────────────────────────────────────────────────

/// Default storage directory, relative to the invoking user's home.
pub const DEFAULT_STORAGE_DIR: &str = ".hyperkit";

/// Sub-directory of the storage path holding one directory per machine.
pub const MACHINES_DIR: &str = "machines";

/// Sub-directory of the storage path caching downloaded boot images.
pub const CACHE_DIR: &str = "cache";

/// Driver defaults file inside the storage path (YAML).
pub const DRIVER_CONFIG_FILENAME: &str = "config.yaml";

// ─── Machine directory ────────────────────────────────────────────────────

/// Persisted machine record (config + last known address).
pub const MACHINE_CONFIG_FILENAME: &str = "config.json";

/// Launch record written by the privileged launch path. Holds the pid.
pub const LAUNCH_RECORD_FILENAME: &str = "hyperkit.json";

/// Hypervisor stdout/stderr.
pub const HYPERVISOR_LOG_FILENAME: &str = "hyperkit.log";

/// Advisory lock file held for the duration of Start.
pub const LOCK_FILENAME: &str = ".lock";

/// Boot image copied into the machine directory.
pub const BOOT_IMAGE_FILENAME: &str = "boot2docker.iso";

/// Extracted kernel.
pub const KERNEL_FILENAME: &str = "bzimage";

/// Extracted initial ramdisk.
pub const INITRD_FILENAME: &str = "initrd";

/// Extracted boot-loader configuration.
pub const BOOT_CONFIG_FILENAME: &str = "isolinux.cfg";

/// Private SSH key; the public half is `<name>.pub`.
pub const SSH_KEY_FILENAME: &str = "id_rsa";

/// Serial console pty link and ring log.
pub const CONSOLE_TTY_FILENAME: &str = "tty";
pub const CONSOLE_LOG_FILENAME: &str = "console-ring";

// ─── Host ─────────────────────────────────────────────────────────────────

/// Host NFS export table.
pub const EXPORTS_FILE: &str = "/etc/exports";

/// Host NFS daemon.
pub const NFSD_PATH: &str = "/sbin/nfsd";

/// vmnet DHCP lease table.
pub const DHCPD_LEASES_FILE: &str = "/var/db/dhcpd_leases";

/// vmnet shared-network preferences (holds `Shared_Net_Address`).
pub const VMNET_PREFERENCES: &str = "/Library/Preferences/SystemConfiguration/com.apple.vmnet";
