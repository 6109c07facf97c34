//! Seed disk creation.
//!
//! boot2docker formats its data disk on first boot when the disk starts with
//! a tar stream whose first entry is the magic "format-me" file. The rest of
//! the stream is unpacked into the docker user's home, which is how the SSH
//! public key reaches the guest.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::{Gid, Uid, chown, getegid, getuid};
use tracing::{debug, info};

use pkg_constants::vm::{DISK_BYTES_PER_MB, SEED_DISK_MAGIC};

use crate::error::MachineError;

/// Create `disk_path` as a seed disk of exactly `size_mb * 1_000_000` bytes.
///
/// The file is created exclusively: an existing disk is never overwritten.
pub fn create_raw_disk(disk_path: &Path, public_key: &[u8], size_mb: u64) -> Result<()> {
    let size = size_mb
        .checked_mul(DISK_BYTES_PER_MB)
        .with_context(|| format!("disk size {} MB is too large", size_mb))?;

    let file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(disk_path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(MachineError::DiskExists(disk_path.to_path_buf()).into());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create {}", disk_path.display()));
        }
    };

    let mut builder = tar::Builder::new(BufWriter::new(file));
    append_file(&mut builder, SEED_DISK_MAGIC, SEED_DISK_MAGIC.as_bytes(), 0o644)?;
    append_dir(&mut builder, ".ssh/", 0o700)?;
    append_file(&mut builder, ".ssh/authorized_keys", public_key, 0o644)?;
    append_file(&mut builder, ".ssh/authorized_keys2", public_key, 0o644)?;

    let mut writer = builder.into_inner().context("failed to finish seed archive")?;
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("failed to flush seed archive")?;

    let seed_len = file.metadata()?.len();
    if size < seed_len {
        anyhow::bail!(
            "disk size {} MB is smaller than the {} byte seed archive",
            size_mb,
            seed_len
        );
    }
    file.set_len(size)
        .with_context(|| format!("failed to size {}", disk_path.display()))?;
    file.sync_all()?;

    info!(path = %disk_path.display(), bytes = size, "created raw disk");
    Ok(())
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    builder
        .append_data(&mut header, name, data)
        .with_context(|| format!("failed to add {} to seed archive", name))
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str, mode: u32) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(mode);
    builder
        .append_data(&mut header, name, std::io::empty())
        .with_context(|| format!("failed to add {} to seed archive", name))
}

/// Hand everything under `dir` to the invoking user.
///
/// Ownership is the real uid with the effective gid, so nothing stays owned
/// by root when the driver runs setuid.
pub fn fix_permissions(dir: &Path) -> Result<()> {
    debug!(path = %dir.display(), "fixing permissions");
    chown_tree(dir, getuid(), getegid())
}

fn chown_tree(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    chown(path, Some(uid), Some(gid))
        .with_context(|| format!("failed to chown {}", path.display()))?;

    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}
