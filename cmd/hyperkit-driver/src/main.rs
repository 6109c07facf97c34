//! hyperkit-driver: runs one hyperkit guest per machine directory.
//!
//! The binary is installed setuid root. The first thing `main` does is check
//! whether it was re-invoked for a privileged sub-operation; if not, it drops
//! root for good before parsing the command line or starting the runtime.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pkg_constants::paths::{DEFAULT_STORAGE_DIR, DRIVER_CONFIG_FILENAME, MACHINE_CONFIG_FILENAME};
use pkg_machine::config::{DriverConfigFile, load_config_file, resolve_cmdline};
use pkg_machine::privilege;
use pkg_machine::{LifecycleController, MachineConfig, MachineError, MachineState};

mod store;

use store::MachineRecord;

#[derive(Parser)]
#[command(name = "hyperkit-driver")]
#[command(about = "Create, boot and tear down hyperkit virtual machines")]
#[command(version)]
struct Cli {
    /// Directory holding machines and the boot image cache [default: ~/.hyperkit]
    #[arg(long, global = true)]
    storage_path: Option<PathBuf>,

    /// Machine to operate on
    #[arg(long, global = true, default_value = "default")]
    machine_name: String,

    /// Log at debug level
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a new machine and start it
    Create(CreateArgs),
    /// Start a stopped machine
    Start,
    /// Stop a machine gracefully, killing it if it does not exit
    Stop,
    /// Kill a machine
    Kill,
    /// Stop a machine if needed and delete it
    Remove,
    /// Stop then start a machine
    Restart,
    /// Print the machine state
    Status,
    /// Print the machine IP address
    Ip,
    /// Print the driver version
    Version,
}

// ── Create ──────────────────────────────────────────────────────────────

#[derive(clap::Args)]
struct CreateArgs {
    /// Number of CPUs
    #[arg(long)]
    cpus: Option<u32>,
    /// Memory in MB
    #[arg(long)]
    memory: Option<u64>,
    /// Disk size in MB
    #[arg(long)]
    disk_size: Option<u64>,
    /// Boot image URL or path
    #[arg(long)]
    iso_url: Option<String>,
    /// Kernel command line; a leading '+' appends to the default
    #[arg(long)]
    boot_options: Option<String>,
    /// Share hostPath[:guestMountPoint] over NFS (repeatable)
    #[arg(long = "nfs-share")]
    nfs_shares: Vec<String>,
    /// Guest directory for shares without a mount point
    #[arg(long)]
    nfs_shares_root: Option<String>,
    /// Guest vsock ports forwarded to the host (repeatable)
    #[arg(long = "vsock-port")]
    vsock_ports: Vec<u32>,
    /// Fixed machine UUID
    #[arg(long)]
    uuid: Option<uuid::Uuid>,
    /// hyperkit executable
    #[arg(long)]
    hyperkit: Option<PathBuf>,
    /// vpnkit socket; uses vmnet when unset
    #[arg(long)]
    vpnkit_sock: Option<PathBuf>,
}

// ════════════════════════════════════════════════════════════════════════
// Main
// ════════════════════════════════════════════════════════════════════════

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if let Some(op) = args.get(1)
        && privilege::is_privileged_op(op)
    {
        init_tracing("warn");
        process::exit(privilege::serve(&args[1..]));
    }

    if let Err(e) = privilege::drop_privileges() {
        eprintln!("{:#}", e);
        process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(if cli.debug { "debug" } else { "info" });

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("{:#}", e);
        process::exit(1);
    }
}

/// Logs go to stderr; stdout carries command output.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let storage = match cli.storage_path {
        Some(path) => path,
        None => dirs::home_dir()
            .context("cannot determine home directory")?
            .join(DEFAULT_STORAGE_DIR),
    };
    let name = cli.machine_name;

    match cli.command {
        Command::Create(args) => cmd_create(&storage, &name, args).await,
        Command::Start => cmd_start(&storage, &name).await,
        Command::Stop => cmd_stop(&storage, &name).await,
        Command::Kill => cmd_kill(&storage, &name).await,
        Command::Remove => cmd_remove(&storage, &name).await,
        Command::Restart => cmd_restart(&storage, &name).await,
        Command::Status => cmd_status(&storage, &name),
        Command::Ip => cmd_ip(&storage, &name),
        Command::Version => {
            println!("hyperkit-driver {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Build a machine config. Merge: CLI args > config file > defaults.
fn machine_config(
    storage: &std::path::Path,
    name: &str,
    args: CreateArgs,
    file_cfg: DriverConfigFile,
) -> MachineConfig {
    let mut cfg = MachineConfig::new(name, storage);
    if let Some(cpus) = args.cpus.or(file_cfg.cpus) {
        cfg.cpus = cpus;
    }
    if let Some(memory) = args.memory.or(file_cfg.memory) {
        cfg.memory_mb = memory;
    }
    if let Some(disk) = args.disk_size.or(file_cfg.disk_size) {
        cfg.disk_size_mb = disk;
    }
    cfg.boot_image = args.iso_url.or(file_cfg.iso_url).unwrap_or_default();
    cfg.cmdline = resolve_cmdline(args.boot_options.or(file_cfg.boot_options).as_deref());
    if let Some(root) = args.nfs_shares_root.or(file_cfg.mount_root) {
        cfg.nfs_shares_root = root;
    }
    cfg.shares = args.nfs_shares;
    cfg.vsock_ports = args.vsock_ports;
    cfg.uuid = args.uuid;
    cfg.hyperkit = args.hyperkit.or(file_cfg.hyperkit);
    cfg.vpnkit_sock = args.vpnkit_sock;
    cfg
}

fn controller(record: &MachineRecord) -> Result<LifecycleController> {
    Ok(LifecycleController::system(record.config.clone())?.with_known_ip(record.ip.clone()))
}

fn save(ctl: &LifecycleController) -> Result<()> {
    let mut record = MachineRecord::new(ctl.config().clone());
    record.ip = ctl.ip().map(str::to_string);
    record.save()
}

// ── Commands ────────────────────────────────────────────────────────────

async fn cmd_create(storage: &std::path::Path, name: &str, args: CreateArgs) -> Result<()> {
    let file_cfg: DriverConfigFile = load_config_file(&storage.join(DRIVER_CONFIG_FILENAME))?;
    let cfg = machine_config(storage, name, args, file_cfg);
    cfg.validate()?;

    // An existing machine keeps its record; Create never replaces it.
    let record_path = cfg.machine_dir().join(MACHINE_CONFIG_FILENAME);
    if record_path.exists() {
        anyhow::bail!("machine '{}' already exists ({})", name, record_path.display());
    }
    let disk = cfg.disk_path();
    if disk.exists() {
        return Err(MachineError::DiskExists(disk).into());
    }

    info!(
        "creating machine {}: cpus={}, memory={}MB, disk={}MB",
        name, cfg.cpus, cfg.memory_mb, cfg.disk_size_mb
    );
    let mut ctl = LifecycleController::system(cfg)?;
    let result = ctl.create().await;
    // Persist whatever was provisioned so a later stop/remove can clean up.
    if ctl.config().machine_dir().exists() {
        save(&ctl)?;
    }
    result
}

async fn cmd_start(storage: &std::path::Path, name: &str) -> Result<()> {
    let mut ctl = controller(&MachineRecord::load(storage, name)?)?;
    let result = ctl.start().await;
    save(&ctl)?;
    result
}

async fn cmd_stop(storage: &std::path::Path, name: &str) -> Result<()> {
    let mut ctl = controller(&MachineRecord::load(storage, name)?)?;
    ctl.stop().await?;
    save(&ctl)
}

async fn cmd_kill(storage: &std::path::Path, name: &str) -> Result<()> {
    let mut ctl = controller(&MachineRecord::load(storage, name)?)?;
    ctl.kill().await?;
    save(&ctl)
}

async fn cmd_remove(storage: &std::path::Path, name: &str) -> Result<()> {
    let record = MachineRecord::load(storage, name)?;
    let mut ctl = controller(&record)?;
    ctl.remove().await?;
    record.delete()?;
    info!("removed machine {}", name);
    Ok(())
}

async fn cmd_restart(storage: &std::path::Path, name: &str) -> Result<()> {
    let mut ctl = controller(&MachineRecord::load(storage, name)?)?;
    let result = ctl.restart().await;
    save(&ctl)?;
    result
}

fn cmd_status(storage: &std::path::Path, name: &str) -> Result<()> {
    let ctl = controller(&MachineRecord::load(storage, name)?)?;
    let state = ctl.runtime_state();
    println!("{}", state.state);
    if state.state == MachineState::Running {
        info!(pid = state.pid, "hyperkit process");
    }
    Ok(())
}

fn cmd_ip(storage: &std::path::Path, name: &str) -> Result<()> {
    let record = MachineRecord::load(storage, name)?;
    let ctl = controller(&record)?;
    match (ctl.get_state()?, record.ip) {
        (MachineState::Running, Some(ip)) => {
            println!("{}", ip);
            Ok(())
        }
        _ => anyhow::bail!("machine {} is not running", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_args(extra: &[&str]) -> CreateArgs {
        let mut argv = vec!["hyperkit-driver", "create"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Create(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let file_cfg = DriverConfigFile {
            cpus: Some(2),
            memory: Some(4096),
            boot_options: Some("+debug".into()),
            ..Default::default()
        };
        let cfg = machine_config(
            std::path::Path::new("/store"),
            "dev",
            create_args(&["--cpus", "4", "--nfs-share", "/a", "--nfs-share", "/b:/mnt/b"]),
            file_cfg,
        );
        assert_eq!(cfg.cpus, 4);
        assert_eq!(cfg.memory_mb, 4096);
        assert!(cfg.cmdline.ends_with(" debug"));
        assert_eq!(cfg.shares, vec!["/a", "/b:/mnt/b"]);
        assert_eq!(cfg.disk_size_mb, pkg_constants::vm::DEFAULT_DISK_SIZE_MB);
    }

    #[tokio::test]
    async fn test_create_keeps_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = MachineRecord::new(MachineConfig::new("dev", dir.path()));
        record.config.boot_kernel = Some(record.config.resolve("bzimage"));
        record.config.shares = vec!["/a".into()];
        record.ip = Some("192.168.64.7".into());
        record.save().unwrap();
        std::fs::write(record.config.disk_path(), b"").unwrap();

        let err = cmd_create(dir.path(), "dev", create_args(&["--cpus", "8"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(MachineRecord::load(dir.path(), "dev").unwrap(), record);
    }

    #[tokio::test]
    async fn test_create_refuses_orphan_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = MachineConfig::new("dev", dir.path());
        std::fs::create_dir_all(cfg.machine_dir()).unwrap();
        std::fs::write(cfg.disk_path(), b"").unwrap();

        let err = cmd_create(dir.path(), "dev", create_args(&[]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MachineError>(),
            Some(MachineError::DiskExists(_))
        ));
        assert!(MachineRecord::load(dir.path(), "dev").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "hyperkit-driver",
            "status",
            "--machine-name",
            "dev",
            "--storage-path",
            "/tmp/s",
        ]);
        assert_eq!(cli.machine_name, "dev");
        assert_eq!(cli.storage_path, Some(PathBuf::from("/tmp/s")));
    }
}
