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

//! Opening datasets by path

use std::path::Path;
use std::sync::Arc;

use halotree_common::HaloTreeConfig;
use tracing::info;

use crate::backend::{CsvOptions, DataBackend, is_csv_path, read_csv};
use crate::error::{ArborResult, BackendError};
use crate::graph::Arbor;
use crate::persistence::{CanonicalBackend, HEADER_EXTENSION};

/// Supported on-disk formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Canonical,
    Csv,
}

/// Options for [`load`]
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Format to use instead of guessing from the path.
    pub format: Option<DataFormat>,
    pub csv: CsvOptions,
    pub config: HaloTreeConfig,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(mut self, format: DataFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn csv(mut self, csv: CsvOptions) -> Self {
        self.csv = csv;
        self
    }

    pub fn config(mut self, config: HaloTreeConfig) -> Self {
        self.config = config;
        self
    }
}

/// Guesses the format of `path`: container headers and directories are canonical, text catalogs are CSV.
pub fn detect_format(path: &Path) -> Option<DataFormat> {
    if path.is_dir() || path.extension().and_then(|ext| ext.to_str()) == Some(HEADER_EXTENSION) {
        Some(DataFormat::Canonical)
    } else if is_csv_path(path) {
        Some(DataFormat::Csv)
    } else {
        None
    }
}

/// Opens the dataset at `path`. Nothing beyond headers is read until the arbor is used.
pub fn load(path: impl AsRef<Path>, options: LoadOptions) -> ArborResult<Arc<Arbor>> {
    let path = path.as_ref();
    let format = options.format.or_else(|| detect_format(path)).ok_or_else(|| BackendError::UnknownFormat(path.to_path_buf()))?;

    let backend: Arc<dyn DataBackend> = match format {
        DataFormat::Canonical => Arc::new(CanonicalBackend::open(path)?),
        DataFormat::Csv => Arc::new(read_csv(path, &options.csv)?),
    };
    info!("Loading {} as {} data", path.display(), backend.format());
    Arbor::with_config(backend, options.config)
}
