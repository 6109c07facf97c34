//! Machine records: `config.json` in each machine directory.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use pkg_constants::paths::{MACHINE_CONFIG_FILENAME, MACHINES_DIR};
use pkg_machine::MachineConfig;

/// Persisted configuration plus the last resolved guest address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(flatten)]
    pub config: MachineConfig,
    #[serde(default)]
    pub ip: Option<String>,
}

impl MachineRecord {
    pub fn new(config: MachineConfig) -> Self {
        Self { config, ip: None }
    }

    pub fn load(storage: &Path, name: &str) -> Result<Self> {
        let path = storage
            .join(MACHINES_DIR)
            .join(name)
            .join(MACHINE_CONFIG_FILENAME);
        let data = std::fs::read(&path).with_context(|| {
            format!("machine '{}' does not exist ({} missing)", name, path.display())
        })?;
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let dir = self.config.machine_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(MACHINE_CONFIG_FILENAME);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Delete the machine directory and everything in it.
    pub fn delete(&self) -> Result<()> {
        let dir = self.config.machine_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }
}
