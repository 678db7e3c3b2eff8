use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::components::history::HistoryLimits;
use crate::error::EditError;
use crate::task::Schedule;

const SETTINGS_FILE: &str = "lumaedit_settings.json";

/// Engine-wide tuning knobs, persisted as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Oldest undo records are dropped beyond this many. `None` = unbounded.
    pub max_undo_steps: Option<usize>,
    /// Approximate memory cap for undo records, in MiB. `None` = unbounded.
    pub max_history_mb: Option<usize>,
    pub histogram_bins: usize,
    /// Where edit and histogram bodies run.
    pub schedule: Schedule,
    /// Pixels per chunk for incremental texture uploads.
    pub upload_chunk_pixels: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: Some(50),
            max_history_mb: Some(512),
            histogram_bins: 256,
            schedule: Schedule::Pool,
            upload_chunk_pixels: 128 * 128,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/lumaedit/lumaedit_settings.json  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\LumaEdit\lumaedit_settings.json
    /// On macOS:   ~/Library/Application Support/LumaEdit/lumaedit_settings.json
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("LumaEdit").join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("LumaEdit")
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("lumaedit").join(SETTINGS_FILE))
        }
    }

    /// Load settings from disk (returns defaults if the file is missing or corrupt).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Self>(&content) {
            Ok(settings) => settings.sanitized(),
            Err(e) => {
                crate::log_warn!("Ignoring malformed settings {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save settings to the default location.
    pub fn save(&self) -> Result<(), EditError> {
        let path = Self::settings_path()
            .ok_or_else(|| EditError::Unsupported("no settings directory on this platform".to_string()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), EditError> {
        let io_err = |e: &dyn std::fmt::Display| EditError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(&e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| io_err(&e))?;
        std::fs::write(path, json).map_err(|e| io_err(&e))?;
        crate::log_info!("Settings written to {}", path.display());
        Ok(())
    }

    /// Clamp values that would make the engine misbehave.
    pub fn sanitized(mut self) -> Self {
        self.max_undo_steps = self.max_undo_steps.map(|n| n.max(1));
        self.histogram_bins = self.histogram_bins.clamp(16, 4096);
        self.upload_chunk_pixels = self.upload_chunk_pixels.max(1);
        self
    }

    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_steps: self.max_undo_steps,
            max_bytes: self.max_history_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
        }
    }
}
