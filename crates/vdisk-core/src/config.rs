use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const APP_DIR: &str = "vdisk";

/// Runtime configuration shared by the core and the host binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdiskConfig {
    /// Local pointer record naming the current tree object
    pub pointer_path: PathBuf,
    /// Base directory of the local content store
    pub store_dir: PathBuf,
    /// Object name the serialized tree is uploaded under
    pub index_object_name: String,
    /// Decrypt downloads locally instead of letting the store do it
    pub decrypt_locally: bool,
    /// Chunks an upload queue holds before writers wait
    pub upload_queue_depth: usize,
    /// Out-of-order bytes one upload may hold
    pub max_parked_bytes: u64,
    /// Limit on a single blocked write, 0 disables
    pub write_timeout_secs: u64,
    /// Reported total and free space
    pub capacity_bytes: u64,
}

impl Default for VdiskConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        Self {
            pointer_path: base.join("data.dat"),
            store_dir: base.join("objects"),
            index_object_name: "vdisk-index.json".into(),
            decrypt_locally: true,
            upload_queue_depth: 4,
            max_parked_bytes: 64 * 1024 * 1024,
            write_timeout_secs: 300,
            capacity_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl VdiskConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Config rooted in `dir`, for tests and throwaway mounts
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            pointer_path: dir.join("data.dat"),
            store_dir: dir.join("objects"),
            ..Self::default()
        }
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_secs > 0).then(|| Duration::from_secs(self.write_timeout_secs))
    }
}
