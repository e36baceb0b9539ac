//! Controller configuration - stored in SESAME_HOME/config.json

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sesame_central::{DEFAULT_HISTORY_TAG, ScanParams};

use crate::ControllerError;

/// Get SESAME_HOME directory (`$SESAME_HOME`, else `~/.sesame`)
pub fn sesame_home() -> Result<PathBuf, ControllerError> {
    if let Ok(home) = std::env::var("SESAME_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".sesame"))
        .ok_or(ControllerError::NoHome)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Index into the adapters reported by the platform
    pub adapter: usize,
    pub active_scan: bool,
    /// Units of 0.625 ms
    pub scan_interval: u16,
    pub scan_window: u16,
    /// History tag recorded by the lock for lock/unlock without an explicit tag
    pub default_tag: String,
    pub auto_lock: bool,
    pub connect_timeout_secs: u64,
    /// Drop a link that makes no progress for this long; off when unset
    pub stall_timeout_secs: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            adapter: 0,
            active_scan: ScanParams::SESAME.active,
            scan_interval: ScanParams::SESAME.interval,
            scan_window: ScanParams::SESAME.window,
            default_tag: String::from_utf8_lossy(DEFAULT_HISTORY_TAG).into_owned(),
            auto_lock: false,
            connect_timeout_secs: 10,
            stall_timeout_secs: None,
        }
    }
}

impl ControllerConfig {
    pub fn default_path() -> Result<PathBuf, ControllerError> {
        Ok(sesame_home()?.join("config.json"))
    }

    /// Load from disk, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        if !path.exists() {
            log::debug!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path).map_err(|source| ControllerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ControllerError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn scan_params(&self) -> ScanParams {
        ScanParams {
            active: self.active_scan,
            interval: self.scan_interval,
            window: self.scan_window,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
