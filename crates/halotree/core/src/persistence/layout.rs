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

//! On-disk layout of a container
//!
//! ```text
//! <dir>/<base>.arbor                  header (JSON)
//! <dir>/<base>.roots                  root values of every saved field
//! <dir>/<base>_0000.shard             per-node columns of shard 0
//! <dir>/<base>-analysis.arbor         analysis header
//! <dir>/<base>-analysis.roots         root values of analysis fields
//! <dir>/<base>_0000-analysis.shard    analysis columns of shard 0
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const HEADER_EXTENSION: &str = "arbor";
pub const ROOTS_EXTENSION: &str = "roots";
pub const SHARD_EXTENSION: &str = "shard";
pub const ANALYSIS_SUFFIX: &str = "-analysis";

/// Paths of every file of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLayout {
    directory: PathBuf,
    basename: String,
}

impl ContainerLayout {
    pub fn new(directory: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            basename: basename.into(),
        }
    }

    /// Layout for a save target. `out/name` becomes `out/name/name.arbor`; a path ending in `.arbor` is used as the header itself.
    pub fn from_output(path: &Path) -> Self {
        if path.extension().and_then(|ext| ext.to_str()) == Some(HEADER_EXTENSION) {
            return Self::from_header(path);
        }
        let basename = path.file_name().map_or_else(|| "arbor".to_string(), |name| name.to_string_lossy().to_string());
        Self::new(path, basename)
    }

    /// Layout of an existing container given its header path.
    pub fn from_header(path: &Path) -> Self {
        let directory = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let basename = path.file_stem().map_or_else(|| "arbor".to_string(), |stem| stem.to_string_lossy().to_string());
        Self::new(directory, basename)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn ensure_directory(&self) -> io::Result<()> {
        fs::create_dir_all(&self.directory)
    }

    pub fn header_path(&self) -> PathBuf {
        self.directory.join(format!("{}.{}", self.basename, HEADER_EXTENSION))
    }

    pub fn roots_path(&self) -> PathBuf {
        self.directory.join(format!("{}.{}", self.basename, ROOTS_EXTENSION))
    }

    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!("{}_{:04}.{}", self.basename, index, SHARD_EXTENSION))
    }

    pub fn analysis_header_path(&self) -> PathBuf {
        self.directory.join(format!("{}{}.{}", self.basename, ANALYSIS_SUFFIX, HEADER_EXTENSION))
    }

    pub fn analysis_roots_path(&self) -> PathBuf {
        self.directory.join(format!("{}{}.{}", self.basename, ANALYSIS_SUFFIX, ROOTS_EXTENSION))
    }

    pub fn analysis_shard_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!("{}_{:04}{}.{}", self.basename, index, ANALYSIS_SUFFIX, SHARD_EXTENSION))
    }

    /// Indices of the main shard files present on disk, sorted.
    pub fn list_shards(&self) -> io::Result<Vec<usize>> {
        let prefix = format!("{}_", self.basename);
        let suffix = format!(".{SHARD_EXTENSION}");
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some(index) = name.strip_prefix(&prefix).and_then(|rest| rest.strip_suffix(&suffix)) else { continue };
            if let Ok(index) = index.parse::<usize>() {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}
