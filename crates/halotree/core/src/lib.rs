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

//! Halo merger trees behind one lazily built graph model
//!
//! An [`Arbor`] wraps a [`DataBackend`] and a field registry. Entries are
//! located on first use, forests are linked when a node first needs them
//! and fields are resolved in whole-forest batches. Analysis fields can be
//! set on any node and written out to the canonical container, whose sidecar
//! layer can be updated in place.

pub mod analysis;
pub mod backend;
pub mod error;
pub mod fields;
pub mod graph;
pub mod load;
pub mod parallel;
pub mod persistence;
pub mod traversal;

pub use analysis::{AnalysisPipeline, AnalysisTarget, Operation, OperationContext, Recipe};
pub use backend::{ArborMetadata, DataBackend, FieldDeclarations, MemoryBackend, Reassignment};
pub use error::*;
pub use fields::{DataType, DerivedFunction, FieldArray, FieldContext, FieldValue, FieldValues, Quantity};
pub use graph::{Arbor, Node};
pub use load::{DataFormat, LoadOptions, load};
pub use parallel::{Distribution, ExecutionContext, ParallelOptions, ParallelOutcome, SaveEvery, parallel_nodes, parallel_tree_nodes, parallel_trees};
pub use persistence::SaveOptions;
pub use traversal::{Predicate, Selection, Selector, register_selector};
