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

//! Data-file backends
//!
//! A backend knows how one catalog format stores halos. It declares the native
//! fields it provides, locates every forest block ("planting") and reads
//! columns for a set of rows of one backing file. Everything above the backend
//! works only in terms of these storage coordinates.

pub mod csv;
pub mod memory;

pub use self::csv::*;
pub use memory::*;

use std::collections::BTreeMap;
use std::path::Path;

use halotree_common::Uid;
use serde::{Deserialize, Serialize};

use crate::error::ArborResult;
use crate::fields::{DataType, FieldValues};

/// Storage coordinates of one forest block: rows `start..end` of backing file `file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForestLocation {
    pub file: usize,
    pub start: usize,
    pub end: usize,
    /// Uid of the block's first row, the root of the entry.
    pub root_uid: Uid,
}

impl ForestLocation {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Rows requested from one backing file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSelection {
    Range { start: usize, end: usize },
    Rows(Vec<usize>),
}

impl RowSelection {
    pub fn len(&self) -> usize {
        match self {
            RowSelection::Range { start, end } => end - start,
            RowSelection::Rows(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the selected rows out of a full-file column. `None` if the column is too short.
    pub fn apply(&self, column: &FieldValues) -> Option<FieldValues> {
        match self {
            RowSelection::Range { start, end } => column.slice(*start, *end),
            RowSelection::Rows(rows) => column.select(rows),
        }
    }

    /// Largest row index touched, plus one.
    pub fn bound(&self) -> usize {
        match self {
            RowSelection::Range { end, .. } => *end,
            RowSelection::Rows(rows) => rows.iter().max().map_or(0, |r| r + 1),
        }
    }
}

/// A descendant link rewritten by a backend before the graph model sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    pub uid: Uid,
    pub old_desc_uid: Uid,
    pub new_desc_uid: Uid,
    pub reason: String,
}

/// Result of planting: every entry's block plus the link diagnostics
#[derive(Debug, Clone, Default)]
pub struct PlantedForests {
    pub locations: Vec<ForestLocation>,
    pub reassignments: Vec<Reassignment>,
}

/// A field stored by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct NativeField {
    pub name: String,
    pub units: String,
    pub dtype: DataType,
    pub description: Option<String>,
}

impl NativeField {
    pub fn new(name: impl Into<String>, units: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            units: units.into(),
            dtype,
            description: None,
        }
    }
}

/// An alternative name for a native field, optionally converting units
#[derive(Debug, Clone, PartialEq)]
pub struct AliasDeclaration {
    pub alias: String,
    pub target: String,
    pub units: Option<String>,
}

impl AliasDeclaration {
    pub fn new(alias: impl Into<String>, target: impl Into<String>, units: Option<&str>) -> Self {
        Self {
            alias: alias.into(),
            target: target.into(),
            units: units.map(str::to_string),
        }
    }
}

/// An analysis field persisted by an earlier save
#[derive(Debug, Clone, PartialEq)]
pub struct SavedAnalysisField {
    pub name: String,
    pub units: String,
    pub dtype: DataType,
    pub default: f64,
    pub description: Option<String>,
}

/// Field declarations consumed at arbor construction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDeclarations {
    pub native: Vec<NativeField>,
    pub aliases: Vec<AliasDeclaration>,
    pub analysis: Vec<SavedAnalysisField>,
}

/// Cosmology and box metadata of a catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArborMetadata {
    pub hubble_constant: Option<f64>,
    pub omega_matter: Option<f64>,
    pub omega_lambda: Option<f64>,
    pub box_size: Option<f64>,
    pub box_size_units: Option<String>,
}

/// Contract between the graph model and a catalog format.
///
/// `read_fields` must return one column per requested field, each holding
/// exactly `rows.len()` values in row order.
pub trait DataBackend: Send + Sync {
    /// Human readable dataset name.
    fn name(&self) -> &str;

    /// Short identifier of the storage format.
    fn format(&self) -> &'static str;

    /// True for the canonical container, which supports in-place saves.
    fn is_canonical(&self) -> bool {
        false
    }

    /// Location of the dataset on disk, if any.
    fn source_path(&self) -> Option<&Path> {
        None
    }

    fn field_declarations(&self) -> FieldDeclarations;

    fn metadata(&self) -> ArborMetadata;

    /// Locates every forest block. Called once per arbor.
    fn plant(&self) -> ArborResult<PlantedForests>;

    fn read_fields(&self, file: usize, rows: &RowSelection, fields: &[String]) -> ArborResult<BTreeMap<String, FieldValues>>;

    /// Root values of every entry, in entry order, when the format indexes them.
    fn read_root_fields(&self, _fields: &[String]) -> ArborResult<Option<BTreeMap<String, FieldValues>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_selection_apply() {
        let column = FieldValues::Int(vec![10, 11, 12, 13]);
        assert_eq!(RowSelection::Range { start: 1, end: 3 }.apply(&column), Some(FieldValues::Int(vec![11, 12])));
        let rows = RowSelection::Rows(vec![3, 0]);
        assert_eq!(rows.apply(&column), Some(FieldValues::Int(vec![13, 10])));
        assert_eq!(RowSelection::Rows(vec![4]).apply(&column), None);
        assert_eq!(rows.bound(), 4);
        assert_eq!(RowSelection::Rows(Vec::new()).bound(), 0);
    }
}
