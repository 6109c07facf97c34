//! Boot image provisioning: everything Create puts into the machine directory
//! before the first Start.

pub mod disk;
pub mod iso;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use pkg_constants::paths::{
    BOOT_CONFIG_FILENAME, BOOT_IMAGE_FILENAME, CACHE_DIR, INITRD_FILENAME, KERNEL_FILENAME,
};

use crate::config::MachineConfig;
use crate::error::MachineError;
use iso::IsoImage;

pub use disk::{create_raw_disk, fix_permissions};

const KERNEL_CANDIDATES: &[&str] = &["/boot/vmlinuz64", "/boot/vmlinuz", "/boot/bzimage"];
const INITRD_CANDIDATES: &[&str] = &["/boot/initrd.img", "/boot/initrd"];
const BOOT_CONFIG_CANDIDATES: &[&str] = &["/boot/isolinux/isolinux.cfg"];

/// Files extracted from the boot image, all inside the machine directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArtifacts {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub boot_config: PathBuf,
}

/// Creates the disk and boot artifacts of one machine.
pub struct BootImageProvisioner<'a> {
    cfg: &'a MachineConfig,
}

impl<'a> BootImageProvisioner<'a> {
    pub fn new(cfg: &'a MachineConfig) -> Self {
        Self { cfg }
    }

    pub fn boot_image_path(&self) -> PathBuf {
        self.cfg.resolve(BOOT_IMAGE_FILENAME)
    }

    /// Boot image, SSH key, seed disk, ownership, then boot artifacts.
    pub async fn provision(&self) -> Result<BootArtifacts> {
        let machine_dir = self.cfg.machine_dir();
        std::fs::create_dir_all(&machine_dir)
            .with_context(|| format!("failed to create {}", machine_dir.display()))?;

        let iso_path = self.boot_image_path();
        fetch_boot_image(
            &self.cfg.boot_image,
            &self.cfg.storage_path.join(CACHE_DIR),
            &iso_path,
        )
        .await
        .context("copying boot image to machine dir")?;

        let public_key = ensure_ssh_key(&self.cfg.ssh_key_path())
            .await
            .context("generating ssh key")?;

        let disk_path = self.cfg.disk_path();
        info!(path = %disk_path.display(), size_mb = self.cfg.disk_size_mb, "creating raw disk image");
        create_raw_disk(&disk_path, &public_key, self.cfg.disk_size_mb)?;
        fix_permissions(&machine_dir)
            .with_context(|| format!("fixing permissions on {}", machine_dir.display()))?;

        extract_boot_artifacts(&iso_path, &machine_dir).context("extracting kernel")
    }
}

/// Copy the boot image named by `source` to `dest`.
///
/// `source` is an `http(s)://` URL, a `file://` URL or a local path. An empty
/// source reuses `<cache_dir>/boot2docker.iso`.
pub async fn fetch_boot_image(source: &str, cache_dir: &Path, dest: &Path) -> Result<()> {
    if source.starts_with("http://") || source.starts_with("https://") {
        info!("Downloading boot image from {}", source);
        return download_file(source, dest).await;
    }

    let local = match source.strip_prefix("file://") {
        Some(path) => PathBuf::from(path),
        None if source.is_empty() => cache_dir.join(BOOT_IMAGE_FILENAME),
        None => PathBuf::from(source),
    };
    if !local.is_file() {
        anyhow::bail!("boot image {} not found", local.display());
    }
    debug!(from = %local.display(), to = %dest.display(), "copying boot image");
    tokio::fs::copy(&local, dest)
        .await
        .with_context(|| format!("failed to copy {}", local.display()))?;
    Ok(())
}

async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;

    let response = client
        .get(url)
        .send()
        .await
        .context("HTTP request failed")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed: HTTP {} for {}", response.status(), url);
    }

    let bytes = response.bytes().await?;
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}

/// Make sure an RSA key pair exists at `key_path`. Returns the public key.
pub async fn ensure_ssh_key(key_path: &Path) -> Result<Vec<u8>> {
    let public_path = public_key_path(key_path);
    if !(key_path.exists() && public_path.exists()) {
        let output = tokio::process::Command::new("ssh-keygen")
            .args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"])
            .arg(key_path)
            .output()
            .await
            .context("failed to run ssh-keygen")?;
        if !output.status.success() {
            anyhow::bail!(
                "ssh-keygen failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }
    tokio::fs::read(&public_path)
        .await
        .with_context(|| format!("failed to read {}", public_path.display()))
}

fn public_key_path(key_path: &Path) -> PathBuf {
    let mut name = key_path.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

/// Extract kernel, initrd and boot-loader config from `iso_path` into `dest_dir`.
///
/// Each artifact is looked up at its well-known paths; a missing or empty
/// one fails with `MissingBootArtifact` naming it.
pub fn extract_boot_artifacts(iso_path: &Path, dest_dir: &Path) -> Result<BootArtifacts> {
    let file = File::open(iso_path)
        .with_context(|| format!("failed to open {}", iso_path.display()))?;
    let mut image = IsoImage::open(BufReader::new(file))?;

    let kernel = extract_one(&mut image, "kernel", KERNEL_CANDIDATES, &dest_dir.join(KERNEL_FILENAME))?;
    let initrd = extract_one(&mut image, "initrd", INITRD_CANDIDATES, &dest_dir.join(INITRD_FILENAME))?;
    let boot_config = extract_one(
        &mut image,
        "isolinux.cfg",
        BOOT_CONFIG_CANDIDATES,
        &dest_dir.join(BOOT_CONFIG_FILENAME),
    )?;

    info!(kernel = %kernel.display(), initrd = %initrd.display(), "extracted boot artifacts");
    Ok(BootArtifacts {
        kernel,
        initrd,
        boot_config,
    })
}

fn extract_one<R: std::io::Read + std::io::Seek>(
    image: &mut IsoImage<R>,
    kind: &'static str,
    candidates: &[&str],
    dest: &Path,
) -> Result<PathBuf> {
    for candidate in candidates {
        let Some(entry) = image.find(candidate)? else {
            continue;
        };
        if entry.is_dir || entry.size == 0 {
            continue;
        }
        let mut out = File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        image.copy_to(&entry, &mut out)?;
        debug!(kind, from = candidate, "extracted");
        return Ok(dest.to_path_buf());
    }
    Err(MachineError::MissingBootArtifact(kind).into())
}

#[cfg(test)]
mod tests {
    use super::iso::testutil::IsoBuilder;
    use super::*;
    use crate::error::is_kind;

    #[test]
    fn test_extract_boot_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("boot.iso");
        let image = IsoBuilder::new()
            .file("/boot/vmlinuz", b"kernel")
            .file("/boot/initrd", b"initrd")
            .file("/boot/isolinux/isolinux.cfg", b"cfg")
            .build();
        std::fs::write(&iso, image).unwrap();

        let artifacts = extract_boot_artifacts(&iso, dir.path()).unwrap();
        assert_eq!(artifacts.kernel, dir.path().join("bzimage"));
        assert_eq!(std::fs::read(&artifacts.kernel).unwrap(), b"kernel");
        assert_eq!(std::fs::read(&artifacts.initrd).unwrap(), b"initrd");
        assert_eq!(std::fs::read(&artifacts.boot_config).unwrap(), b"cfg");
    }

    #[test]
    fn test_each_missing_artifact_is_named() {
        let cases = [
            (
                IsoBuilder::new()
                    .file("/boot/initrd.img", b"i")
                    .file("/boot/isolinux/isolinux.cfg", b"c"),
                "kernel",
            ),
            (
                IsoBuilder::new()
                    .file("/boot/vmlinuz64", b"k")
                    .file("/boot/initrd.img", b"")
                    .file("/boot/isolinux/isolinux.cfg", b"c"),
                "initrd",
            ),
            (
                IsoBuilder::new()
                    .file("/boot/vmlinuz64", b"k")
                    .file("/boot/initrd.img", b"i"),
                "isolinux.cfg",
            ),
        ];

        for (builder, expected) in cases {
            let dir = tempfile::tempdir().unwrap();
            let iso = dir.path().join("boot.iso");
            std::fs::write(&iso, builder.build()).unwrap();
            let err = extract_boot_artifacts(&iso, dir.path()).unwrap_err();
            assert!(
                is_kind(&err, |e| matches!(e, MachineError::MissingBootArtifact(k) if *k == expected)),
                "expected missing {expected}, got {err:#}"
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_boot_image_from_path_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.iso");
        std::fs::write(&src, b"iso").unwrap();

        let dest = dir.path().join("a.iso");
        fetch_boot_image(src.to_str().unwrap(), dir.path(), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"iso");

        let dest = dir.path().join("b.iso");
        let url = format!("file://{}", src.display());
        fetch_boot_image(&url, dir.path(), &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"iso");

        let cache = dir.path().join("cache");
        std::fs::create_dir(&cache).unwrap();
        std::fs::write(cache.join(BOOT_IMAGE_FILENAME), b"cached").unwrap();
        let dest = dir.path().join("c.iso");
        fetch_boot_image("", &cache, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_existing_key_pair_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(&key, b"private").unwrap();
        std::fs::write(dir.path().join("id_rsa.pub"), b"ssh-rsa AAAA").unwrap();
        assert_eq!(ensure_ssh_key(&key).await.unwrap(), b"ssh-rsa AAAA");
    }
}
