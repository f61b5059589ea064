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

#![allow(dead_code)]

use std::sync::Arc;

use halotree_core::backend::MemoryBackend;
use halotree_core::{Arbor, DataBackend, FieldValues};

pub fn ints(values: &[i64]) -> FieldValues {
    FieldValues::Int(values.to_vec())
}

pub fn floats(values: &[f64]) -> FieldValues {
    FieldValues::Float(values.to_vec())
}

/// Four halos: 2 and 3 merge into 1, 4 is a progenitor of 2.
pub fn create_worked_backend(masses: [f64; 4]) -> MemoryBackend {
    MemoryBackend::builder("worked")
        .column("uid", ints(&[1, 2, 3, 4]), "")
        .column("desc_uid", ints(&[-1, 1, 1, 2]), "")
        .column("mass", floats(&masses), "Msun")
        .build()
        .unwrap()
}

pub fn create_worked_arbor(masses: [f64; 4]) -> Arc<Arbor> {
    Arbor::new(create_worked_backend(masses)).unwrap()
}

/// Three trees of sizes 3, 1 and 4, with positions and a virial mass.
pub fn create_catalog_backend(files: usize) -> MemoryBackend {
    MemoryBackend::builder("catalog")
        .column("uid", ints(&[10, 11, 12, 20, 30, 31, 32, 33]), "")
        .column("desc_uid", ints(&[-1, 10, 10, -1, -1, 30, 31, 30]), "")
        .column("Mvir", floats(&[12.0, 7.0, 5.0, 3.0, 20.0, 11.0, 6.0, 9.0]), "Msun")
        .column("x", floats(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]), "kpc")
        .column("y", floats(&[0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0]), "kpc")
        .column("z", floats(&[0.0, 0.0, 0.0, 3.0, 12.0, 0.0, 0.0, 0.0]), "kpc")
        .alias("mass", "Mvir", None)
        .files(files)
        .build()
        .unwrap()
}

pub fn create_catalog_arbor() -> Arc<Arbor> {
    Arbor::new(create_catalog_backend(2)).unwrap()
}

/// The catalog arbor together with a handle on its backend for read counting.
pub fn create_counted_arbor() -> (Arc<Arbor>, Arc<MemoryBackend>) {
    let backend = Arc::new(create_catalog_backend(2));
    let shared: Arc<dyn DataBackend> = backend.clone();
    let arbor = Arbor::with_config(shared, Default::default()).unwrap();
    (arbor, backend)
}

pub fn uids(nodes: &[halotree_core::Node]) -> Vec<i64> {
    nodes.iter().map(|node| node.uid()).collect()
}
