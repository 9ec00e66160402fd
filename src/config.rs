// ⚙️ Settings - TOML file with defaults, created on first run
//
//   [attendance]   default_days
//   [storage]      database, output_dir, log_dir  (relative to the config file)
//   [registration] api_base_url, api_token

use crate::defaulters::DEFAULT_WINDOW;
use crate::error::{AttendanceError, Result};
use crate::registration::DEFAULT_API_BASE_URL;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const APP_DIR: &str = "class-attendance";
pub const CONFIG_FILE: &str = "config.toml";
pub const LOG_FILE: &str = "class-attendance.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceSettings {
    /// Trailing sessions a registrant may miss before becoming a defaulter
    pub default_days: usize,
}

impl Default for AttendanceSettings {
    fn default() -> Self {
        Self {
            default_days: DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database: PathBuf,
    pub output_dir: PathBuf,
    /// Debug-level log files, rotated daily
    pub log_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: PathBuf::from("class-attendance.db"),
            output_dir: PathBuf::from("output"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    pub api_base_url: String,
    pub api_token: String,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub attendance: AttendanceSettings,
    pub storage: StorageSettings,
    pub registration: RegistrationSettings,

    /// Directory relative storage paths resolve against
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Settings {
    /// `<config dir>/class-attendance/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(CONFIG_FILE)
    }

    /// Read `path`, writing a default file there first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let defaults = Settings::default();
            fs::write(path, defaults.to_toml()?)?;
            info!("Created default settings at {}", path.display());
        }

        let text = fs::read_to_string(path)?;
        let mut settings = Self::from_toml(&text)?;
        settings.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| AttendanceError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AttendanceError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.attendance.default_days == 0 {
            return Err(AttendanceError::Config(
                "attendance.default_days must be at least 1".to_string(),
            ));
        }
        if self.registration.api_base_url.trim().is_empty() {
            return Err(AttendanceError::Config(
                "registration.api_base_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join(&self.storage.database)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base_dir.join(&self.storage.output_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join(&self.storage.log_dir)
    }
}
