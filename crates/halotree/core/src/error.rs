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

//! Error types
//!
//! One enum per concern, all folded into [`ArborError`] so that every public
//! operation can return [`ArborResult`].

use std::path::PathBuf;

use halotree_common::{ConfigError, Uid, UnitError};
use thiserror::Error;

use crate::traversal::Selection;

/// Integrity and lookup errors of the halo graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Dangling descendant in forest {entry}: halo {uid} points to desc_uid {desc_uid}, which is not in the forest")]
    DanglingDescendant { entry: usize, uid: Uid, desc_uid: Uid },

    #[error("Duplicate uid {uid} in forest {entry}")]
    DuplicateUid { entry: usize, uid: Uid },

    #[error("Descendant links of halo {uid} form a cycle")]
    DescendantCycle { uid: Uid },

    #[error("Arbor index out of range: {index} (size {size})")]
    EntryOutOfRange { index: usize, size: usize },

    #[error("Node index {index} out of range for {selection} selection of length {len}")]
    NodeIndexOutOfRange { selection: Selection, index: usize, len: usize },

    #[error("Unknown selector: {0}")]
    UnknownSelector(String),

    #[error("Selector {selector} returned index {index} for {len} ancestors")]
    SelectorOutOfRange { selector: String, index: usize, len: usize },
}

/// Field lookup and resolution errors
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("Field not found: {field}")]
    NotFound { field: String },

    #[error("Field {field} depends on {dependency}, which cannot be resolved")]
    DependencyNotFound { field: String, dependency: String },

    #[error("Circular dependency detected while resolving field {field}")]
    CircularDependency { field: String },

    #[error("Cannot express field {field} in {to}: values are in {from}")]
    DimensionMismatch { field: String, from: String, to: String },

    #[error("Invalid units for field {field}: {source}")]
    Units { field: String, source: UnitError },

    #[error("Vector field {field}: component {component} has units '{units}', expected '{expected}'")]
    ConflictingComponentUnits { field: String, component: String, units: String, expected: String },

    #[error("Field {field} cannot be set, only analysis fields are settable")]
    Unsettable { field: String },

    #[error("Field {field} already exists")]
    AlreadyExists { field: String },

    #[error("Field {field} is a vector field, a scalar was required")]
    NotScalar { field: String },

    #[error("Field {field} produced {found} values, expected {expected}")]
    LengthMismatch { field: String, expected: usize, found: usize },

    #[error("Cannot assign {value} to field {field}")]
    InvalidValue { field: String, value: String },
}

/// Errors raised by data-file backends
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("Parse error in {path} at line {line}: {message}")]
    Parse { path: PathBuf, line: usize, message: String },

    #[error("Backend does not provide field {field}")]
    MissingField { field: String },

    #[error("Duplicate uid {uid} in catalog")]
    DuplicateUid { uid: Uid },

    #[error("Column {field} has {found} rows, expected {expected}")]
    ColumnLength { field: String, expected: usize, found: usize },

    #[error("Invalid rows {start}..{end} requested from file {file}")]
    InvalidRows { file: usize, start: usize, end: usize },

    #[error("Cannot determine the format of {0}")]
    UnknownFormat(PathBuf),
}

/// Errors raised while reading or writing the canonical container
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("Failed to encode {path}: {message}")]
    Encode { path: PathBuf, message: String },

    #[error("Failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Corrupted file {path}: {message}")]
    Corruption { path: PathBuf, message: String },

    #[error("Unsupported format version {found} in {path}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
}

/// Save configurations rejected before any I/O
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaveError {
    #[error("In-place save requires every root of the arbor, a subset was given")]
    InPlaceWithSubset,

    #[error("In-place save cannot be combined with the roots-only fast path")]
    InPlaceWithRootsOnly,

    #[error("In-place save writes to the loaded container and cannot take a new filename")]
    InPlaceWithFilename,

    #[error("In-place save requires an arbor loaded from the canonical format")]
    InPlaceNotCanonical,

    #[error("Roots-only save requires an arbor loaded from the canonical format")]
    RootsOnlyNotCanonical,

    #[error("Saving would overwrite the container the arbor is reading from")]
    OverwritesSource,

    #[error("Nothing to save: no trees selected")]
    NoTrees,

    #[error("Tree belongs to a different arbor")]
    ForeignTree,
}

#[derive(Debug, Error)]
pub enum ParallelError {
    #[error("Worker {worker} failed: {source}")]
    WorkerFailed { worker: usize, source: Box<ArborError> },

    #[error("Worker {worker} panicked")]
    WorkerPanicked { worker: usize },

    #[error("Invalid execution context: {0}")]
    InvalidContext(String),

    #[error("save_every requires collect_results")]
    SaveWithoutCollect,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to create output directory {path}: {source}")]
    OutputDirectory { path: PathBuf, source: std::io::Error },

    #[error("Operation {operation} failed: {source}")]
    Operation { operation: String, source: Box<ArborError> },

    #[error("Preprocessing for operation {operation} failed: {source}")]
    Preprocess { operation: String, source: Box<ArborError> },
}

/// Top-level error of the halotree library
#[derive(Debug, Error)]
pub enum ArborError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Parallel(#[from] ParallelError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Units(#[from] UnitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failure reported by user-supplied analysis code.
    #[error("{0}")]
    Custom(String),
}

impl ArborError {
    /// Creates an error carrying a free-form message from user code.
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

pub type ArborResult<T> = Result<T, ArborError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_name_offending_field() {
        let err: ArborError = FieldError::DimensionMismatch {
            field: "mass".to_string(),
            from: "kpc".to_string(),
            to: "Msun".to_string(),
        }
        .into();
        assert!(err.to_string().contains("mass"));

        let err: ArborError = GraphError::DanglingDescendant { entry: 0, uid: 4, desc_uid: 9 }.into();
        let message = err.to_string();
        assert!(message.contains('4') && message.contains('9'));
    }

    #[test]
    fn test_worker_failure_wraps_source() {
        let err = ParallelError::WorkerFailed {
            worker: 2,
            source: Box::new(ArborError::custom("boom")),
        };
        assert_eq!(err.to_string(), "Worker 2 failed: boom");
    }
}
