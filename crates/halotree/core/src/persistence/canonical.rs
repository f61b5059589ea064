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

//! Backend over the canonical container
//!
//! Root values come from the root indices, so queries over all roots never
//! touch a shard. Forest reads keep the most recently used shard (and its
//! analysis sidecar) in memory. Analysis columns missing from a sidecar shard
//! fall back to the field default, and root rows always take their value from
//! the analysis root index, which a roots-only save may have updated alone.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::format::{AnalysisHeader, ColumnBlock, ContainerHeader, FORMAT_VERSION, ROOTS_MAGIC, SHARD_MAGIC, SavedField, read_block, read_header};
use super::layout::{ContainerLayout, HEADER_EXTENSION};
use crate::backend::{ArborMetadata, DataBackend, FieldDeclarations, ForestLocation, NativeField, PlantedForests, RowSelection, SavedAnalysisField};
use crate::error::{ArborResult, BackendError, PersistenceError};
use crate::fields::FieldValues;

type ShardSlot = Mutex<Option<(usize, Option<Arc<ColumnBlock>>)>>;

pub struct CanonicalBackend {
    header_path: PathBuf,
    layout: ContainerLayout,
    header: ContainerHeader,
    analysis: AnalysisHeader,
    roots: ColumnBlock,
    analysis_roots: ColumnBlock,
    locations: Vec<ForestLocation>,
    /// Per file: row of each entry root -> entry index.
    root_rows: Vec<HashMap<usize, usize>>,
    shard: ShardSlot,
    analysis_shard: ShardSlot,
}

impl CanonicalBackend {
    /// Opens a container from its header path or its directory.
    pub fn open(path: impl AsRef<Path>) -> ArborResult<Self> {
        let path = path.as_ref();
        let header_path = if path.is_dir() {
            let name = path.file_name().map_or_else(|| "arbor".to_string(), |name| name.to_string_lossy().to_string());
            path.join(format!("{name}.{HEADER_EXTENSION}"))
        } else {
            path.to_path_buf()
        };

        let header: ContainerHeader = read_header(&header_path)?;
        if header.format_version != FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                path: header_path,
                found: header.format_version,
            }
            .into());
        }
        let layout = ContainerLayout::from_header(&header_path);
        let roots = read_block(&layout.roots_path(), ROOTS_MAGIC)?;

        let analysis_header_path = layout.analysis_header_path();
        let (analysis, analysis_roots) = if analysis_header_path.exists() {
            let analysis: AnalysisHeader = read_header(&analysis_header_path)?;
            let roots_path = layout.analysis_roots_path();
            let analysis_roots = if roots_path.exists() { read_block(&roots_path, ROOTS_MAGIC)? } else { ColumnBlock::default() };
            (analysis, analysis_roots)
        } else {
            (
                AnalysisHeader {
                    format_version: FORMAT_VERSION,
                    fields: BTreeMap::new(),
                },
                ColumnBlock::default(),
            )
        };

        let root_uids = roots.get("uid").and_then(FieldValues::to_i64_vec).unwrap_or_default();
        if root_uids.len() != header.total_trees {
            return Err(PersistenceError::Corruption {
                path: layout.roots_path(),
                message: format!("root index holds {} uids for {} trees", root_uids.len(), header.total_trees),
            }
            .into());
        }

        let mut locations = Vec::with_capacity(header.total_trees);
        let mut root_rows = vec![HashMap::new(); header.shards.len()];
        for (file, shard) in header.shards.iter().enumerate() {
            let mut offset = 0;
            for (i, size) in shard.tree_sizes.iter().enumerate() {
                let entry = shard.tree_start + i;
                let root_uid = *root_uids.get(entry).ok_or_else(|| PersistenceError::Corruption {
                    path: header_path.clone(),
                    message: format!("shard {file} names tree {entry} beyond the root index"),
                })?;
                root_rows[file].insert(offset, entry);
                locations.push(ForestLocation {
                    file,
                    start: offset,
                    end: offset + size,
                    root_uid,
                });
                offset += size;
            }
        }

        debug!("Opened {} with {} trees in {} shards", header_path.display(), header.total_trees, header.shards.len());
        Ok(Self {
            header_path,
            layout,
            header,
            analysis,
            roots,
            analysis_roots,
            locations,
            root_rows,
            shard: Mutex::new(None),
            analysis_shard: Mutex::new(None),
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn analysis_header(&self) -> &AnalysisHeader {
        &self.analysis
    }

    pub fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    fn cached_block(&self, slot: &ShardSlot, file: usize, path: PathBuf, required: bool) -> ArborResult<Option<Arc<ColumnBlock>>> {
        let mut slot = slot.lock();
        if let Some((cached, block)) = slot.as_ref()
            && *cached == file
        {
            return Ok(block.clone());
        }
        let block = if required || path.exists() {
            trace!("Reading {}", path.display());
            Some(Arc::new(read_block(&path, SHARD_MAGIC)?))
        } else {
            None
        };
        *slot = Some((file, block.clone()));
        Ok(block)
    }

    fn analysis_values(&self, field: &str, info: &SavedField, file: usize, rows: &RowSelection, sidecar: Option<&ColumnBlock>) -> FieldValues {
        let mut values = sidecar
            .and_then(|block| block.get(field))
            .and_then(|column| rows.apply(column))
            .unwrap_or_else(|| FieldValues::filled(info.dtype, rows.len(), info.default.unwrap_or(0.0)));
        if let Some(root_column) = self.analysis_roots.get(field) {
            for (position, row) in selected_rows(rows).into_iter().enumerate() {
                if let Some(value) = self.root_rows[file].get(&row).and_then(|entry| root_column.value_at(*entry)) {
                    values.set(position, &value);
                }
            }
        }
        values
    }
}

fn selected_rows(rows: &RowSelection) -> Vec<usize> {
    match rows {
        RowSelection::Range { start, end } => (*start..*end).collect(),
        RowSelection::Rows(rows) => rows.clone(),
    }
}

impl DataBackend for CanonicalBackend {
    fn name(&self) -> &str {
        &self.header.source_name
    }

    fn format(&self) -> &'static str {
        "canonical"
    }

    fn is_canonical(&self) -> bool {
        true
    }

    fn source_path(&self) -> Option<&Path> {
        Some(&self.header_path)
    }

    fn field_declarations(&self) -> FieldDeclarations {
        let native = self
            .header
            .fields
            .iter()
            .map(|(name, info)| {
                let mut field = NativeField::new(name.clone(), info.units.clone(), info.dtype);
                field.description = info.description.clone();
                field
            })
            .collect();
        let analysis = self
            .analysis
            .fields
            .iter()
            .filter(|(name, _)| !self.header.fields.contains_key(*name))
            .map(|(name, info)| SavedAnalysisField {
                name: name.clone(),
                units: info.units.clone(),
                dtype: info.dtype,
                default: info.default.unwrap_or(0.0),
                description: info.description.clone(),
            })
            .collect();
        FieldDeclarations {
            native,
            aliases: Vec::new(),
            analysis,
        }
    }

    fn metadata(&self) -> ArborMetadata {
        self.header.metadata.clone()
    }

    fn plant(&self) -> ArborResult<PlantedForests> {
        Ok(PlantedForests {
            locations: self.locations.clone(),
            reassignments: Vec::new(),
        })
    }

    fn read_fields(&self, file: usize, rows: &RowSelection, fields: &[String]) -> ArborResult<BTreeMap<String, FieldValues>> {
        if file >= self.header.shards.len() {
            return Err(BackendError::InvalidRows {
                file,
                start: 0,
                end: rows.bound(),
            }
            .into());
        }

        let (main, analysis): (Vec<&String>, Vec<&String>) = fields.iter().partition(|field| self.header.fields.contains_key(*field));
        let mut result = BTreeMap::new();

        if !main.is_empty() {
            let shard = self.cached_block(&self.shard, file, self.layout.shard_path(file), true)?.ok_or(BackendError::InvalidRows { file, start: 0, end: rows.bound() })?;
            for field in main {
                let column = shard.get(field).ok_or_else(|| BackendError::MissingField { field: field.clone() })?;
                let values = rows.apply(column).ok_or(BackendError::InvalidRows { file, start: 0, end: rows.bound() })?;
                result.insert(field.clone(), values);
            }
        }

        if !analysis.is_empty() {
            let sidecar = self.cached_block(&self.analysis_shard, file, self.layout.analysis_shard_path(file), false)?;
            for field in analysis {
                let info = self.analysis.fields.get(field).ok_or_else(|| BackendError::MissingField { field: field.clone() })?;
                result.insert(field.clone(), self.analysis_values(field, info, file, rows, sidecar.as_deref()));
            }
        }
        Ok(result)
    }

    fn read_root_fields(&self, fields: &[String]) -> ArborResult<Option<BTreeMap<String, FieldValues>>> {
        let mut result = BTreeMap::new();
        for field in fields {
            let values = if let Some(column) = self.roots.get(field) {
                column.clone()
            } else if let Some(info) = self.analysis.fields.get(field) {
                match self.analysis_roots.get(field) {
                    Some(column) => column.clone(),
                    None => FieldValues::filled(info.dtype, self.header.total_trees, info.default.unwrap_or(0.0)),
                }
            } else {
                return Ok(None);
            };
            result.insert(field.clone(), values);
        }
        Ok(Some(result))
    }
}
