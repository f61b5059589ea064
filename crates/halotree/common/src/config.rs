// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! User configuration
//!
//! Settings are read from a JSON file. The location is `$HALOTREE_CONFIG` if set,
//! otherwise `halotree/config.json` under the platform configuration directory
//! (`$XDG_CONFIG_HOME` or `~/.config` on Linux, `~/Library/Application Support`
//! on macOS, `%APPDATA%` on Windows). A missing file yields the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "HALOTREE_CONFIG";

/// Default number of nodes written to a single shard file.
pub const DEFAULT_MAX_FILE_SIZE: usize = 524_288;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse config {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaloTreeConfig {
    /// Selector installed on newly loaded arbors.
    pub default_selector: String,
    /// Field the default selector compares.
    pub selector_field: String,
    /// Nodes per shard when saving.
    pub max_file_size: usize,
    /// Worker count for parallel iteration; `None` uses every available core.
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for HaloTreeConfig {
    fn default() -> Self {
        Self {
            default_selector: "max_field_value".to_string(),
            selector_field: "mass".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            workers: None,
            log_level: "info".to_string(),
        }
    }
}

impl HaloTreeConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(io_error)
    }

    /// Location searched when no explicit path is given.
    pub fn default_path() -> Option<PathBuf> {
        match std::env::var(CONFIG_ENV) {
            Ok(explicit) if !explicit.is_empty() => Some(PathBuf::from(explicit)),
            _ => Self::platform_path(),
        }
    }

    /// `halotree/config.json` in the platform configuration directory.
    pub fn platform_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("halotree").join("config.json"))
    }

    /// Loads the configuration from `cli_config` or the default location.
    pub fn resolve_config(cli_config: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = cli_config {
            return Self::load_from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                debug!("Loading configuration from {}", path.display());
                Self::load_from_file(path)
            }
            _ => Ok(Self::default()),
        }
    }
}
