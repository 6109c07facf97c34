//! Host NFS export table management.
//!
//! Every export this driver writes is wrapped in marker comments carrying its
//! identifier, so it can be found and removed later without looking at the
//! path it exports:
//!
//! ```text
//! # BEGIN - docker-machine-driver-hyperkit dev-/Users/me/src
//! "/Users/me/src" 192.168.64.7 -alldirs -mapall=me
//! # END - docker-machine-driver-hyperkit dev-/Users/me/src
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use nix::unistd::{Uid, getuid, setuid};
use tracing::{debug, info, warn};

use pkg_constants::network::EXPORT_IDENTIFIER_PREFIX;
use pkg_constants::paths::{EXPORTS_FILE, NFSD_PATH};

use crate::error::{MachineError, is_kind};

/// Identifier of the export for `share` of `machine`. Built from the share as
/// configured, never from the resolved path.
pub fn export_identifier(machine: &str, share: &str) -> String {
    format!("{} {}-{}", EXPORT_IDENTIFIER_PREFIX, machine, share)
}

/// One export to add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub identifier: String,
    pub path: PathBuf,
    pub client_ip: String,
}

impl ExportEntry {
    /// The exports(5) line: any subdirectory, every guest user mapped to `user`.
    pub fn line(&self, user: &str) -> String {
        format!(
            "\"{}\" {} -alldirs -mapall={}",
            self.path.display(),
            self.client_ip,
            user
        )
    }
}

fn begin_marker(identifier: &str) -> String {
    format!("# BEGIN - {}", identifier)
}

fn end_marker(identifier: &str) -> String {
    format!("# END - {}", identifier)
}

/// In-memory copy of the export table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportsTable {
    lines: Vec<String>,
}

impl ExportsTable {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
        }
    }

    /// Load `path`; a missing table is empty.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Replace `path` with the table, via a temp file in the same directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.render())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        let begin = begin_marker(identifier);
        self.lines.iter().any(|l| *l == begin)
    }

    /// Paths exported by lines outside any marker block.
    fn foreign_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let mut inside = false;
        for line in &self.lines {
            let trimmed = line.trim();
            if trimmed.starts_with("# BEGIN - ") {
                inside = true;
            } else if trimmed.starts_with("# END - ") {
                inside = false;
            } else if !inside && !trimmed.is_empty() && !trimmed.starts_with('#') {
                if let Some(path) = exported_path(trimmed) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    /// Append `entry`. An identifier already present is left untouched and
    /// reported as `false`. A path already exported by someone else is an
    /// `ExportConflict`.
    pub fn add(&mut self, entry: &ExportEntry, user: &str) -> Result<bool> {
        let path = entry.path.to_string_lossy().to_string();
        for (what, value) in [
            ("identifier", entry.identifier.as_str()),
            ("path", path.as_str()),
            ("client address", entry.client_ip.as_str()),
            ("user", user),
        ] {
            if value.contains(char::is_control) || (what == "path" && value.contains('"')) {
                anyhow::bail!("export {} contains a control character or quote: {:?}", what, value);
            }
        }
        if self.contains(&entry.identifier) {
            return Ok(false);
        }
        if self.foreign_paths().contains(&path) {
            return Err(MachineError::ExportConflict {
                path: entry.path.clone(),
                detail: "path is already exported".to_string(),
            }
            .into());
        }
        self.lines.push(begin_marker(&entry.identifier));
        self.lines.push(entry.line(user));
        self.lines.push(end_marker(&entry.identifier));
        Ok(true)
    }

    /// Drop the block for `identifier`.
    pub fn remove(&mut self, identifier: &str) -> Result<()> {
        let begin = begin_marker(identifier);
        let end = end_marker(identifier);
        let start = self
            .lines
            .iter()
            .position(|l| *l == begin)
            .ok_or_else(|| anyhow::anyhow!("export '{}' not found", identifier))?;
        let stop = self.lines[start..]
            .iter()
            .position(|l| *l == end)
            .map(|offset| start + offset)
            .ok_or_else(|| anyhow::anyhow!("export '{}' has no end marker", identifier))?;
        self.lines.drain(start..=stop);
        Ok(())
    }
}

/// First token of an exports(5) line, honouring double quotes.
fn exported_path(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix('"') {
        return rest.split_once('"').map(|(p, _)| p.to_string());
    }
    line.split_whitespace().next().map(str::to_string)
}

/// The NFS server: validates candidate tables and reloads the live one.
pub trait ExportDaemon {
    /// Validate a candidate table. `Err` carries the daemon's complaint.
    fn check(&self, content: &str) -> Result<()>;
    fn reload(&self) -> Result<()>;
}

/// `/sbin/nfsd`.
pub struct Nfsd {
    binary: PathBuf,
    /// Root-owned directory for candidate tables.
    scratch_dir: PathBuf,
}

impl Default for Nfsd {
    fn default() -> Self {
        let scratch_dir = Path::new(EXPORTS_FILE)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/etc"));
        Self {
            binary: PathBuf::from(NFSD_PATH),
            scratch_dir,
        }
    }
}

impl Nfsd {
    pub fn new(binary: &Path, scratch_dir: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
            scratch_dir: scratch_dir.to_path_buf(),
        }
    }
}

impl ExportDaemon for Nfsd {
    fn check(&self, content: &str) -> Result<()> {
        // Candidate tables live beside the real one, never under the caller's TMPDIR.
        let mut tmp = tempfile::Builder::new()
            .prefix(".exports.")
            .tempfile_in(&self.scratch_dir)
            .with_context(|| {
                format!("failed to create a scratch file in {}", self.scratch_dir.display())
            })?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        let output = Command::new(&self.binary)
            .arg("-F")
            .arg(tmp.path())
            .arg("checkexports")
            .output();
        tmp.close().context("failed to remove the scratch exports file")?;
        let output = output.context("failed to run nfsd checkexports")?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            anyhow::bail!("{}", text.trim());
        }
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        // nfsd refuses to run for a non-root real uid.
        let _root = RootIdentity::acquire()?;
        let output = Command::new(&self.binary)
            .arg("restart")
            .output()
            .context("failed to run nfsd restart")?;
        if !output.status.success() {
            anyhow::bail!(
                "Reloading nfsd failed: {}\n{}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Become root for real (not just effectively) until dropped.
struct RootIdentity {
    real_uid: Uid,
}

impl RootIdentity {
    fn acquire() -> Result<Self> {
        let real_uid = getuid();
        if !real_uid.is_root() {
            setuid(Uid::from_raw(0)).context("failed to become root")?;
        }
        Ok(Self { real_uid })
    }
}

impl Drop for RootIdentity {
    fn drop(&mut self) {
        if self.real_uid.is_root() {
            return;
        }
        // Back to the invoking user as real uid, keeping root as effective uid.
        let rc = unsafe { libc::setreuid(self.real_uid.as_raw(), 0) };
        if rc != 0 {
            warn!("failed to restore real uid {}", self.real_uid);
        }
    }
}

/// Applies export batches to the host table.
pub struct ExportManager<D> {
    table_path: PathBuf,
    daemon: D,
}

impl ExportManager<Nfsd> {
    pub fn system() -> Self {
        Self::new(Path::new(EXPORTS_FILE), Nfsd::default())
    }
}

impl<D: ExportDaemon> ExportManager<D> {
    pub fn new(table_path: &Path, daemon: D) -> Self {
        Self {
            table_path: table_path.to_path_buf(),
            daemon,
        }
    }

    /// Add `entries`, mapped to `user`, and reload the daemon.
    ///
    /// Entries that conflict with an existing export are skipped; their
    /// identifiers and reasons are returned.
    pub fn add(&self, user: &str, entries: &[ExportEntry]) -> Result<Vec<String>> {
        let mut table = ExportsTable::load(&self.table_path)?;
        let mut skipped = Vec::new();

        for entry in entries {
            let mut candidate = table.clone();
            let result = candidate.add(entry, user).and_then(|added| {
                if added {
                    self.daemon.check(&candidate.render()).map_err(|e| {
                        let detail = format!("{:#}", e);
                        if detail.contains("conflicts with existing export") {
                            MachineError::ExportConflict {
                                path: entry.path.clone(),
                                detail,
                            }
                            .into()
                        } else {
                            e
                        }
                    })?;
                } else {
                    debug!(identifier = %entry.identifier, "export already present");
                }
                Ok(())
            });

            match result {
                Ok(()) => table = candidate,
                Err(e) if is_kind(&e, |k| matches!(k, MachineError::ExportConflict { .. })) => {
                    warn!("Conflicting NFS Share not setup and ignored: {:#}", e);
                    skipped.push(format!("{}: {:#}", entry.identifier, e));
                }
                Err(e) => return Err(e.context(format!("adding export {}", entry.identifier))),
            }
        }

        table.save(&self.table_path)?;
        self.daemon.reload()?;
        info!(added = entries.len() - skipped.len(), skipped = skipped.len(), "exports updated");
        Ok(skipped)
    }

    /// Remove the exports named by `identifiers` and reload the daemon.
    ///
    /// Never fails on an individual export or on the reload; those problems
    /// come back as warnings.
    pub fn remove(&self, identifiers: &[String]) -> Result<Vec<String>> {
        let mut table = ExportsTable::load(&self.table_path)?;
        let mut warnings = Vec::new();

        for identifier in identifiers {
            if let Err(e) = table.remove(identifier) {
                warn!("failed removing nfs share ({}): {:#}", identifier, e);
                warnings.push(format!("failed removing nfs share ({}): {:#}", identifier, e));
            }
        }

        table.save(&self.table_path)?;
        if let Err(e) = self.daemon.reload() {
            warn!("failed to reload the nfs daemon: {:#}", e);
            warnings.push(format!("failed to reload the nfs daemon: {:#}", e));
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct FakeDaemon {
        /// Paths whose check fails with a conflict.
        conflicting: Vec<String>,
        fail_reload: bool,
        reloads: Cell<u32>,
        checked: RefCell<Vec<String>>,
    }

    impl ExportDaemon for FakeDaemon {
        fn check(&self, content: &str) -> Result<()> {
            self.checked.borrow_mut().push(content.to_string());
            for path in &self.conflicting {
                if content.contains(&format!("\"{}\"", path)) {
                    anyhow::bail!("exports:2: {} conflicts with existing export /", path);
                }
            }
            Ok(())
        }

        fn reload(&self) -> Result<()> {
            self.reloads.set(self.reloads.get() + 1);
            if self.fail_reload {
                anyhow::bail!("nfsd not running");
            }
            Ok(())
        }
    }

    fn entry(machine: &str, share: &str, path: &str) -> ExportEntry {
        ExportEntry {
            identifier: export_identifier(machine, share),
            path: PathBuf::from(path),
            client_ip: "192.168.64.7".into(),
        }
    }

    #[test]
    fn test_identifier_uses_requested_share() {
        assert_eq!(
            export_identifier("dev", "/b:/mnt/b"),
            "docker-machine-driver-hyperkit dev-/b:/mnt/b"
        );
    }

    #[test]
    fn test_add_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exports");
        std::fs::write(&path, "/srv -ro\n").unwrap();

        let mgr = ExportManager::new(&path, FakeDaemon::default());
        let skipped = mgr.add("me", &[entry("dev", "/a", "/a")]).unwrap();
        assert!(skipped.is_empty());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "/srv -ro\n\
             # BEGIN - docker-machine-driver-hyperkit dev-/a\n\
             \"/a\" 192.168.64.7 -alldirs -mapall=me\n\
             # END - docker-machine-driver-hyperkit dev-/a\n"
        );

        let warnings = mgr
            .remove(&[export_identifier("dev", "/a")])
            .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "/srv -ro\n");
        assert_eq!(mgr.daemon.reloads.get(), 2);
    }

    #[test]
    fn test_conflicting_share_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exports");
        let daemon = FakeDaemon {
            conflicting: vec!["/a".into()],
            ..Default::default()
        };
        let mgr = ExportManager::new(&path, daemon);

        let skipped = mgr
            .add(
                "me",
                &[entry("dev", "/a", "/a"), entry("dev", "/b:/mnt/b", "/b")],
            )
            .unwrap();

        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].starts_with("docker-machine-driver-hyperkit dev-/a"));
        let table = ExportsTable::load(&path).unwrap();
        assert!(!table.contains(&export_identifier("dev", "/a")));
        assert!(table.contains(&export_identifier("dev", "/b:/mnt/b")));
    }

    #[test]
    fn test_foreign_export_of_same_path_conflicts() {
        let mut table = ExportsTable::parse("\"/Users/me\" -alldirs\n");
        let err = table
            .add(&entry("dev", "/Users/me", "/Users/me"), "me")
            .unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, MachineError::ExportConflict { .. })));
    }

    #[test]
    fn test_line_breaks_never_reach_the_table() {
        let mut table = ExportsTable::default();
        let injected = ExportEntry {
            identifier: export_identifier("dev", "x"),
            path: PathBuf::from("/tmp/x\n/ -maproot=root 10.0.0.66\n/tmp/y"),
            client_ip: "192.168.64.2".into(),
        };
        assert!(table.add(&injected, "me").is_err());
        assert!(table.add(&entry("dev", "/a", "/a"), "me\n/ -maproot=root").is_err());
        assert!(table.add(&entry("dev\r", "/a", "/a"), "me").is_err());
        assert_eq!(table.render(), "");
    }

    #[test]
    fn test_nfsd_check_ignores_tmpdir() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("etc");
        std::fs::create_dir(&scratch).unwrap();
        let victim = dir.path().join("victim");
        std::fs::write(&victim, "untouched\n").unwrap();
        let planted = std::env::temp_dir().join(format!("exports.{}", std::process::id()));
        let _ = std::fs::remove_file(&planted);
        std::os::unix::fs::symlink(&victim, &planted).unwrap();

        let nfsd = Nfsd::new(Path::new("/bin/true"), &scratch);
        let result = nfsd.check("ATTACKER CONTENT\n");
        std::fs::remove_file(&planted).unwrap();

        result.unwrap();
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "untouched\n");
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_nfsd_check_failure_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let nfsd = Nfsd::new(Path::new("/bin/false"), scratch.path());
        assert!(nfsd.check("\"/a\" -alldirs\n").is_err());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_readding_is_idempotent() {
        let mut table = ExportsTable::default();
        let e = entry("dev", "/a", "/a");
        assert!(table.add(&e, "me").unwrap());
        assert!(!table.add(&e, "me").unwrap());
        assert_eq!(table.render().matches("# BEGIN").count(), 1);
    }

    #[test]
    fn test_other_daemon_failures_abort() {
        struct Broken;
        impl ExportDaemon for Broken {
            fn check(&self, _: &str) -> Result<()> {
                anyhow::bail!("exports:1: bad option")
            }
            fn reload(&self) -> Result<()> {
                Ok(())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mgr = ExportManager::new(&dir.path().join("exports"), Broken);
        assert!(mgr.add("me", &[entry("dev", "/a", "/a")]).is_err());
    }

    #[test]
    fn test_remove_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exports");
        let daemon = FakeDaemon {
            fail_reload: true,
            ..Default::default()
        };
        let mgr = ExportManager::new(&path, daemon);

        let warnings = mgr
            .remove(&["docker-machine-driver-hyperkit dev-/missing".to_string()])
            .unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("not found"));
        assert!(warnings[1].contains("reload"));
    }
}
