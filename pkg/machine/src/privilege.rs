//! The privileged side of the driver and the channel that reaches it.
//!
//! The driver executable is installed setuid root. Every invocation first goes
//! through [`PrivilegedRequest::from_args`]: if `argv[1]` names a privileged
//! sub-operation, the request is validated, executed and the process exits
//! (see [`serve`]). Otherwise [`drop_privileges`] permanently gives up root
//! before anything else runs.
//!
//! Unprivileged code gets back to the privileged side only through a
//! [`PrivilegeBroker`], whose production implementation re-executes the
//! current binary with the request's arguments.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, geteuid, getuid, setuid};
use tracing::{debug, info};

use pkg_constants::network::EXPORT_IDENTIFIER_PREFIX;

use crate::error::MachineError;
use crate::exports::{ExportEntry, ExportManager};
use crate::hyperkit::{self, Disk, HypervisorConfig};
use crate::supervisor::ProcessSupervisor;

pub const OP_LAUNCH_HYPERVISOR: &str = "launch-hypervisor";
pub const OP_MUTATE_EXPORTS: &str = "mutate-exports";
pub const OP_RESOLVE_HARDWARE_ADDRESS: &str = "resolve-hardware-address";
pub const OP_SIGNAL_HYPERVISOR: &str = "signal-hypervisor";

const PRIVILEGED_OPS: &[&str] = &[
    OP_LAUNCH_HYPERVISOR,
    OP_MUTATE_EXPORTS,
    OP_RESOLVE_HARDWARE_ADDRESS,
    OP_SIGNAL_HYPERVISOR,
];

/// Whether `arg` names a privileged sub-operation.
pub fn is_privileged_op(arg: &str) -> bool {
    PRIVILEGED_OPS.contains(&arg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorSignal {
    Terminate,
    Kill,
}

impl HypervisorSignal {
    fn as_arg(self) -> &'static str {
        match self {
            HypervisorSignal::Terminate => "term",
            HypervisorSignal::Kill => "kill",
        }
    }

    fn signal(self) -> Signal {
        match self {
            HypervisorSignal::Terminate => Signal::SIGTERM,
            HypervisorSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// A fully validated request for the privileged side.
#[derive(Debug, Clone, PartialEq)]
pub enum PrivilegedRequest {
    LaunchHypervisor {
        config: HypervisorConfig,
        disks: Vec<Disk>,
        cmdline: String,
    },
    AddExports {
        user: String,
        entries: Vec<ExportEntry>,
    },
    RemoveExports {
        identifiers: Vec<String>,
    },
    ResolveHardwareAddress {
        uuid: String,
        hyperkit: Option<PathBuf>,
    },
    SignalHypervisor {
        machine_dir: PathBuf,
        signal: HypervisorSignal,
    },
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    MachineError::InvalidRequest(msg.into()).into()
}

fn absolute(arg: &str, what: &str) -> Result<PathBuf> {
    let path = PathBuf::from(arg);
    if !path.is_absolute() {
        return Err(invalid(format!("{} must be an absolute path: '{}'", what, arg)));
    }
    Ok(path)
}

fn check_identifier(identifier: &str) -> Result<()> {
    if !identifier.starts_with(EXPORT_IDENTIFIER_PREFIX)
        || identifier.contains(char::is_control)
    {
        return Err(invalid(format!("not a driver export identifier: '{}'", identifier)));
    }
    Ok(())
}

impl PrivilegedRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            PrivilegedRequest::LaunchHypervisor { .. } => OP_LAUNCH_HYPERVISOR,
            PrivilegedRequest::AddExports { .. } | PrivilegedRequest::RemoveExports { .. } => {
                OP_MUTATE_EXPORTS
            }
            PrivilegedRequest::ResolveHardwareAddress { .. } => OP_RESOLVE_HARDWARE_ADDRESS,
            PrivilegedRequest::SignalHypervisor { .. } => OP_SIGNAL_HYPERVISOR,
        }
    }

    /// Argument vector (without the program name).
    pub fn to_args(&self) -> Result<Vec<String>> {
        let mut args = vec![self.op_name().to_string()];
        match self {
            PrivilegedRequest::LaunchHypervisor {
                config,
                disks,
                cmdline,
            } => {
                args.push(serde_json::to_string(config)?);
                args.push(serde_json::to_string(disks)?);
                args.push(cmdline.clone());
            }
            PrivilegedRequest::AddExports { user, entries } => {
                args.push("add".into());
                args.push(user.clone());
                for entry in entries {
                    args.push(entry.identifier.clone());
                    args.push(entry.path.to_string_lossy().to_string());
                    args.push(entry.client_ip.clone());
                }
            }
            PrivilegedRequest::RemoveExports { identifiers } => {
                args.push("remove".into());
                args.extend(identifiers.iter().cloned());
            }
            PrivilegedRequest::ResolveHardwareAddress { uuid, hyperkit } => {
                args.push(uuid.clone());
                if let Some(path) = hyperkit {
                    args.push(path.to_string_lossy().to_string());
                }
            }
            PrivilegedRequest::SignalHypervisor {
                machine_dir,
                signal,
            } => {
                args.push(machine_dir.to_string_lossy().to_string());
                args.push(signal.as_arg().into());
            }
        }
        Ok(args)
    }

    /// Parse and validate `args` (without the program name).
    pub fn from_args(args: &[String]) -> Result<Self> {
        let Some((op, rest)) = args.split_first() else {
            return Err(invalid("missing sub-operation"));
        };

        match op.as_str() {
            OP_LAUNCH_HYPERVISOR => {
                let [config, disks, cmdline] = rest else {
                    return Err(invalid("usage: launch-hypervisor CONFIG DISKS CMDLINE"));
                };
                let config: HypervisorConfig = serde_json::from_str(config)
                    .map_err(|e| invalid(format!("hypervisor config: {}", e)))?;
                let disks: Vec<Disk> = serde_json::from_str(disks)
                    .map_err(|e| invalid(format!("disk list: {}", e)))?;
                for (what, path) in [
                    ("hyperkit", &config.hyperkit),
                    ("state directory", &config.state_dir),
                    ("kernel", &config.kernel),
                    ("initrd", &config.initrd),
                ] {
                    absolute(&path.to_string_lossy(), what)?;
                }
                for disk in &disks {
                    absolute(&disk.path().to_string_lossy(), "disk path")?;
                }
                if cmdline.contains('\0') {
                    return Err(invalid("kernel command line contains NUL"));
                }
                Ok(PrivilegedRequest::LaunchHypervisor {
                    config,
                    disks,
                    cmdline: cmdline.clone(),
                })
            }
            OP_MUTATE_EXPORTS => match rest.split_first() {
                Some((action, tail)) if action == "add" => {
                    let Some((user, triples)) = tail.split_first() else {
                        return Err(invalid("usage: mutate-exports add USER (ID PATH IP)..."));
                    };
                    if user.is_empty()
                        || user.contains(|c: char| c.is_whitespace() || c.is_control())
                    {
                        return Err(invalid(format!("invalid user '{}'", user)));
                    }
                    if triples.is_empty() || triples.len() % 3 != 0 {
                        return Err(invalid("there should be 3 arguments for each export"));
                    }
                    let mut entries = Vec::new();
                    for triple in triples.chunks(3) {
                        check_identifier(&triple[0])?;
                        let path = absolute(&triple[1], "export path")?;
                        if triple[1].contains(|c: char| c == '"' || c.is_control()) {
                            return Err(invalid("export path contains a quote or control character"));
                        }
                        triple[2]
                            .parse::<Ipv4Addr>()
                            .map_err(|_| invalid(format!("invalid client address '{}'", triple[2])))?;
                        entries.push(ExportEntry {
                            identifier: triple[0].clone(),
                            path,
                            client_ip: triple[2].clone(),
                        });
                    }
                    Ok(PrivilegedRequest::AddExports {
                        user: user.clone(),
                        entries,
                    })
                }
                Some((action, identifiers)) if action == "remove" => {
                    if identifiers.is_empty() {
                        return Err(invalid("usage: mutate-exports remove ID..."));
                    }
                    for identifier in identifiers {
                        check_identifier(identifier)?;
                    }
                    Ok(PrivilegedRequest::RemoveExports {
                        identifiers: identifiers.to_vec(),
                    })
                }
                Some((action, _)) => Err(invalid(format!("unknown mutate-exports action: {}", action))),
                None => Err(invalid("usage: mutate-exports add|remove ARGS...")),
            },
            OP_RESOLVE_HARDWARE_ADDRESS => {
                let (uuid, hyperkit) = match rest {
                    [uuid] => (uuid, None),
                    [uuid, hyperkit] => (uuid, Some(absolute(hyperkit, "hyperkit")?)),
                    _ => return Err(invalid("usage: resolve-hardware-address UUID [HYPERKIT]")),
                };
                let uuid = uuid::Uuid::parse_str(uuid)
                    .map_err(|e| invalid(format!("invalid uuid '{}': {}", uuid, e)))?;
                Ok(PrivilegedRequest::ResolveHardwareAddress {
                    uuid: uuid.to_string(),
                    hyperkit,
                })
            }
            OP_SIGNAL_HYPERVISOR => {
                let [dir, signal] = rest else {
                    return Err(invalid("usage: signal-hypervisor MACHINE_DIR term|kill"));
                };
                let signal = match signal.as_str() {
                    "term" => HypervisorSignal::Terminate,
                    "kill" => HypervisorSignal::Kill,
                    other => return Err(invalid(format!("unknown signal '{}'", other))),
                };
                Ok(PrivilegedRequest::SignalHypervisor {
                    machine_dir: absolute(dir, "machine directory")?,
                    signal,
                })
            }
            other => Err(invalid(format!("unknown sub-operation '{}'", other))),
        }
    }

    /// Carry out the request. Privileged side only.
    pub fn execute(self) -> Result<String> {
        match self {
            PrivilegedRequest::LaunchHypervisor {
                config,
                disks,
                cmdline,
            } => {
                let record = hyperkit::launch(&config, &disks, &cmdline)
                    .context("Failed to start hyperkit")?;
                Ok(record.pid.to_string())
            }
            PrivilegedRequest::AddExports { user, entries } => {
                let skipped = ExportManager::system().add(&user, &entries)?;
                Ok(skipped.join("\n"))
            }
            PrivilegedRequest::RemoveExports { identifiers } => {
                let warnings = ExportManager::system().remove(&identifiers)?;
                Ok(warnings.join("\n"))
            }
            PrivilegedRequest::ResolveHardwareAddress { uuid, hyperkit } => {
                let binary = match hyperkit {
                    Some(path) => path,
                    None => hyperkit::find_hyperkit(hyperkit::driver_dir().as_deref())
                        .ok_or_else(|| anyhow::anyhow!("hyperkit not found"))?,
                };
                hyperkit::hardware_address(&binary, &uuid)
                    .context("Getting MAC address from UUID failed")
            }
            PrivilegedRequest::SignalHypervisor {
                machine_dir,
                signal,
            } => {
                let supervisor = ProcessSupervisor::new(&machine_dir);
                match supervisor.running_pid()? {
                    Some(pid) => {
                        kill(Pid::from_raw(pid as i32), signal.signal())
                            .with_context(|| format!("failed to signal pid {}", pid))?;
                        info!(pid, signal = signal.as_arg(), "signalled hypervisor");
                        Ok(pid.to_string())
                    }
                    None => {
                        debug!(dir = %machine_dir.display(), "no hypervisor to signal");
                        Ok(String::new())
                    }
                }
            }
        }
    }
}

/// Run the privileged sub-operation named in `args` and return the exit code.
///
/// The result goes to stdout. Failures print one line to stderr.
pub fn serve(args: &[String]) -> i32 {
    if !geteuid().is_root() {
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "hyperkit-driver".to_string());
        eprintln!(
            "{} needs to run with elevated permissions. \
             Please run the following command, then try again: \
             sudo chown root:wheel {} && sudo chmod u+s {}",
            exe, exe, exe
        );
        return 1;
    }

    let result = PrivilegedRequest::from_args(args).and_then(PrivilegedRequest::execute);
    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            0
        }
        Err(e) => {
            let op = args.first().map(String::as_str).unwrap_or("sub-operation");
            eprintln!("{} failed: {}", op, format!("{:#}", e).replace('\n', " "));
            1
        }
    }
}

/// Irreversibly become the invoking user if running setuid root.
pub fn drop_privileges() -> Result<()> {
    let real = getuid();
    if geteuid().is_root() && !real.is_root() {
        setuid(real).context("failed to drop privileges")?;
        debug!(uid = real.as_raw(), "dropped privileges");
    }
    Ok(())
}

/// Channel from unprivileged code to the privileged side.
#[async_trait]
pub trait PrivilegeBroker: Send + Sync {
    /// Execute `request` and return its standard output.
    async fn invoke(&self, request: PrivilegedRequest) -> Result<String>;

    async fn launch_hypervisor(
        &self,
        config: HypervisorConfig,
        disks: Vec<Disk>,
        cmdline: String,
    ) -> Result<()> {
        self.invoke(PrivilegedRequest::LaunchHypervisor {
            config,
            disks,
            cmdline,
        })
        .await
        .map(|_| ())
    }

    async fn hardware_address(&self, uuid: String, hyperkit: Option<PathBuf>) -> Result<String> {
        let out = self
            .invoke(PrivilegedRequest::ResolveHardwareAddress { uuid, hyperkit })
            .await?;
        Ok(out.trim().to_string())
    }

    /// Returns one line per skipped (conflicting) share.
    async fn add_exports(&self, user: String, entries: Vec<ExportEntry>) -> Result<Vec<String>> {
        let out = self
            .invoke(PrivilegedRequest::AddExports { user, entries })
            .await?;
        Ok(lines(&out))
    }

    /// Returns the non-fatal warnings of the removal.
    async fn remove_exports(&self, identifiers: Vec<String>) -> Result<Vec<String>> {
        let out = self
            .invoke(PrivilegedRequest::RemoveExports { identifiers })
            .await?;
        Ok(lines(&out))
    }

    async fn signal_hypervisor(&self, machine_dir: PathBuf, signal: HypervisorSignal) -> Result<()> {
        self.invoke(PrivilegedRequest::SignalHypervisor {
            machine_dir,
            signal,
        })
        .await
        .map(|_| ())
    }
}

fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Re-executes the driver binary to reach the privileged side.
pub struct SelfInvoker {
    executable: PathBuf,
}

impl SelfInvoker {
    pub fn new(executable: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
        }
    }

    /// Invoker for the running executable.
    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the driver executable")?;
        Ok(Self::new(&exe))
    }
}

#[async_trait]
impl PrivilegeBroker for SelfInvoker {
    async fn invoke(&self, request: PrivilegedRequest) -> Result<String> {
        let args = request.to_args()?;
        debug!(exe = %self.executable.display(), op = request.op_name(), "invoking privileged sub-operation");

        let output = tokio::process::Command::new(&self.executable)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.executable.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            let combined = format!("{}{}", stdout, stderr);
            return Err(MachineError::PrivilegedOperation {
                operation: request.op_name().to_string(),
                output: combined.trim().to_string(),
            }
            .into());
        }
        if !stderr.trim().is_empty() {
            debug!(op = request.op_name(), "{}", stderr.trim());
        }
        Ok(stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_kind;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn hv_config() -> HypervisorConfig {
        HypervisorConfig {
            hyperkit: PathBuf::from("/usr/local/bin/hyperkit"),
            state_dir: PathBuf::from("/m"),
            uuid: "2996454b-06a7-4c9b-8c5c-00d2d0ac6c4a".into(),
            cpus: 1,
            memory_mb: 1024,
            kernel: PathBuf::from("/m/bzimage"),
            initrd: PathBuf::from("/m/initrd"),
            iso_images: vec![],
            vsock_ports: vec![2376],
            vpnkit_sock: None,
        }
    }

    #[test]
    fn test_launch_request_survives_argv() {
        let request = PrivilegedRequest::LaunchHypervisor {
            config: hv_config(),
            disks: vec![Disk::Raw {
                path: PathBuf::from("/m/m.rawdisk"),
                size_mb: 20000,
            }],
            cmdline: "loglevel=3 console=ttyS0".into(),
        };
        let argv = request.to_args().unwrap();
        assert_eq!(argv.len(), 4);
        assert_eq!(argv[0], OP_LAUNCH_HYPERVISOR);
        assert_eq!(PrivilegedRequest::from_args(&argv).unwrap(), request);
    }

    #[test]
    fn test_launch_rejects_relative_paths() {
        let mut config = hv_config();
        config.hyperkit = PathBuf::from("hyperkit");
        let argv = args(&[
            OP_LAUNCH_HYPERVISOR,
            &serde_json::to_string(&config).unwrap(),
            "[]",
            "",
        ]);
        let err = PrivilegedRequest::from_args(&argv).unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, MachineError::InvalidRequest(_))));
    }

    #[test]
    fn test_mutate_exports_parsing() {
        let ident = "docker-machine-driver-hyperkit dev-/a";
        let add = PrivilegedRequest::from_args(&args(&[
            OP_MUTATE_EXPORTS,
            "add",
            "me",
            ident,
            "/a",
            "192.168.64.7",
        ]))
        .unwrap();
        assert_eq!(
            add,
            PrivilegedRequest::AddExports {
                user: "me".into(),
                entries: vec![ExportEntry {
                    identifier: ident.into(),
                    path: PathBuf::from("/a"),
                    client_ip: "192.168.64.7".into(),
                }],
            }
        );

        let remove =
            PrivilegedRequest::from_args(&args(&[OP_MUTATE_EXPORTS, "remove", ident])).unwrap();
        assert_eq!(remove.to_args().unwrap(), args(&[OP_MUTATE_EXPORTS, "remove", ident]));
    }

    #[test]
    fn test_mutate_exports_validation() {
        let ident = "docker-machine-driver-hyperkit dev-/a";
        for bad in [
            args(&[OP_MUTATE_EXPORTS, "add", "me", ident, "/a"]),
            args(&[OP_MUTATE_EXPORTS, "add", "me", ident, "relative", "192.168.64.7"]),
            args(&[OP_MUTATE_EXPORTS, "add", "me", ident, "/a", "not-an-ip"]),
            args(&[OP_MUTATE_EXPORTS, "add", "me", "/etc/passwd", "/a", "192.168.64.7"]),
            args(&[OP_MUTATE_EXPORTS, "remove", "something-else"]),
            args(&[OP_MUTATE_EXPORTS, "flush"]),
            args(&[OP_MUTATE_EXPORTS, "add", "me", ident, "/a\"", "192.168.64.7"]),
        ] {
            assert!(PrivilegedRequest::from_args(&bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_mutate_exports_rejects_line_breaks() {
        let ident = "docker-machine-driver-hyperkit x";
        for bad in [
            args(&[
                OP_MUTATE_EXPORTS,
                "add",
                "me",
                ident,
                "/tmp/x\n/ -maproot=root 10.0.0.66\n/tmp/y",
                "192.168.64.2",
            ]),
            args(&[OP_MUTATE_EXPORTS, "add", "me", ident, "/tmp/x\r/", "192.168.64.2"]),
            args(&[OP_MUTATE_EXPORTS, "add", "me", ident, "/tmp/x\0", "192.168.64.2"]),
            args(&[
                OP_MUTATE_EXPORTS,
                "add",
                "me",
                "docker-machine-driver-hyperkit x\r",
                "/a",
                "192.168.64.2",
            ]),
            args(&[OP_MUTATE_EXPORTS, "add", "me\n/ -maproot=root", ident, "/a", "192.168.64.2"]),
            args(&[OP_MUTATE_EXPORTS, "remove", "docker-machine-driver-hyperkit x\nEND"]),
        ] {
            let err = PrivilegedRequest::from_args(&bad).unwrap_err();
            assert!(is_kind(&err, |e| matches!(e, MachineError::InvalidRequest(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_resolve_and_signal_parsing() {
        let uuid = "2996454b-06a7-4c9b-8c5c-00d2d0ac6c4a";
        assert!(PrivilegedRequest::from_args(&args(&[OP_RESOLVE_HARDWARE_ADDRESS, uuid])).is_ok());
        assert!(
            PrivilegedRequest::from_args(&args(&[OP_RESOLVE_HARDWARE_ADDRESS, "nope"])).is_err()
        );

        let signal =
            PrivilegedRequest::from_args(&args(&[OP_SIGNAL_HYPERVISOR, "/m", "kill"])).unwrap();
        assert_eq!(
            signal,
            PrivilegedRequest::SignalHypervisor {
                machine_dir: PathBuf::from("/m"),
                signal: HypervisorSignal::Kill,
            }
        );
        assert!(PrivilegedRequest::from_args(&args(&[OP_SIGNAL_HYPERVISOR, "/m", "hup"])).is_err());
    }

    #[test]
    fn test_is_privileged_op() {
        assert!(is_privileged_op("launch-hypervisor"));
        assert!(!is_privileged_op("start"));
    }

    #[test]
    fn test_serve_rejects_malformed_request() {
        assert_eq!(serve(&args(&[OP_SIGNAL_HYPERVISOR, "relative", "term"])), 1);
    }

    #[tokio::test]
    async fn test_self_invoker_returns_stdout() {
        let invoker = SelfInvoker::new(Path::new("/bin/echo"));
        let out = invoker
            .invoke(PrivilegedRequest::ResolveHardwareAddress {
                uuid: "2996454b-06a7-4c9b-8c5c-00d2d0ac6c4a".into(),
                hyperkit: None,
            })
            .await
            .unwrap();
        assert_eq!(
            out,
            "resolve-hardware-address 2996454b-06a7-4c9b-8c5c-00d2d0ac6c4a"
        );
    }

    #[tokio::test]
    async fn test_self_invoker_failure_carries_output() {
        let invoker = SelfInvoker::new(Path::new("/bin/sh"));
        let err = invoker
            .invoke(PrivilegedRequest::RemoveExports {
                identifiers: vec!["docker-machine-driver-hyperkit dev-/a".into()],
            })
            .await
            .unwrap_err();
        let Some(MachineError::PrivilegedOperation { operation, output }) =
            err.downcast_ref::<MachineError>()
        else {
            panic!("unexpected error: {err:#}");
        };
        assert_eq!(operation, OP_MUTATE_EXPORTS);
        assert!(output.contains("mutate-exports"), "{output}");
    }
}
