use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE: &str = "lsl-engine.json";

const SETTINGS_VERSION: u32 = 1;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "I/O error: {e}"),
            SettingsError::Json(e) => write!(f, "JSON error: {e}"),
            SettingsError::Invalid(msg) => write!(f, "Invalid settings: {msg}"),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<std::io::Error> for SettingsError {
    fn from(e: std::io::Error) -> Self {
        SettingsError::Io(e)
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(e: serde_json::Error) -> Self {
        SettingsError::Json(e)
    }
}

// ── Engine settings ──────────────────────────────────────────────

/// Limits and switches applied to every script instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub version: u32,
    /// Per-instance memory ceiling, checked at every checkpoint.
    pub memory_limit: i32,
    /// Suspend at every checkpoint. Useful for exercising migration.
    pub always_suspend: bool,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Nested script calls allowed before a handler faults.
    pub max_call_depth: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            memory_limit: 100_000,
            always_suspend: false,
            log_filter: "info".into(),
            max_call_depth: 256,
        }
    }
}

impl EngineSettings {
    fn validate(&self) -> Result<(), SettingsError> {
        if self.version > SETTINGS_VERSION {
            return Err(SettingsError::Invalid(format!(
                "settings version {} is newer than {SETTINGS_VERSION}",
                self.version
            )));
        }
        if self.memory_limit <= 0 {
            return Err(SettingsError::Invalid("memory_limit must be positive".into()));
        }
        if self.max_call_depth == 0 {
            return Err(SettingsError::Invalid("max_call_depth must be at least 1".into()));
        }
        Ok(())
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

/// Load settings from `path`. Missing fields take their defaults.
pub fn load_settings(path: &Path) -> Result<EngineSettings, SettingsError> {
    let data = fs::read_to_string(path)?;
    let settings: EngineSettings = serde_json::from_str(&data)?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings if the file exists, defaults otherwise.
pub fn load_or_default(path: &Path) -> Result<EngineSettings, SettingsError> {
    if path.exists() {
        load_settings(path)
    } else {
        Ok(EngineSettings::default())
    }
}

/// Save settings to `path` through a temporary sibling file.
pub fn save_settings(path: &Path, settings: &EngineSettings) -> Result<(), SettingsError> {
    settings.validate()?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(settings)?;

    let mut tmp_name = OsString::from(path.file_name().unwrap_or_default());
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;
    Ok(())
}
