//! Persistent per-instance modem settings (`modem_nvram.json`)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const NVRAM_FILE_NAME: &str = "modem_nvram.json";

/// Defaults written for an instance that has no record yet
pub const DEFAULT_OPERATOR_NUMERIC: &str = "311740";
pub const DEFAULT_MODEM_TECHNOLOGY: i32 = 5; // LTE
pub const DEFAULT_PREFERRED_NETWORK_MODE: i32 = 0x63; // GSM | WCDMA | LTE | NR

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvramInstance {
    pub network_selection_mode: i32,
    pub operator_numeric: String,
    // Historical key spelling, kept for file compatibility
    #[serde(rename = "modem_technoloy")]
    pub modem_technology: i32,
    pub preferred_network_mode: i32,
    pub emergency_mode: bool,
}

impl Default for NvramInstance {
    fn default() -> Self {
        Self {
            network_selection_mode: 0,
            operator_numeric: DEFAULT_OPERATOR_NUMERIC.to_string(),
            modem_technology: DEFAULT_MODEM_TECHNOLOGY,
            preferred_network_mode: DEFAULT_PREFERRED_NETWORK_MODE,
            emergency_mode: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct NvramFile {
    #[serde(default)]
    instances: BTreeMap<String, NvramInstance>,
}

/// Shared by every modem instance of a process; each instance owns its own key.
pub struct NvramStore {
    path: PathBuf,
    data: Mutex<NvramFile>,
}

impl NvramStore {
    /// Load `path`, falling back to defaults when it is missing or unreadable
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("ignoring corrupt NVRAM file {}: {}", path.display(), e);
                NvramFile::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no NVRAM file at {}, using defaults", path.display());
                NvramFile::default()
            }
            Err(e) => {
                log::warn!("failed to read NVRAM file {}: {}", path.display(), e);
                NvramFile::default()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::load(dir.join(NVRAM_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, NvramFile> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of an instance's settings
    pub fn instance(&self, id: usize) -> NvramInstance {
        self.lock().instances.get(&id.to_string()).cloned().unwrap_or_default()
    }

    pub fn update<F>(&self, id: usize, f: F)
    where
        F: FnOnce(&mut NvramInstance),
    {
        let mut data = self.lock();
        f(data.instances.entry(id.to_string()).or_default());
    }

    /// Write the whole document back to disk
    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&*self.lock())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!("saved NVRAM to {}", self.path.display());
        Ok(())
    }
}
