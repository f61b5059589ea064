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

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::*;
use halotree_core::fields::FieldKind;
use halotree_core::persistence::CanonicalBackend;
use halotree_core::{Arbor, ArborError, DataType, LoadOptions, SaveError, SaveOptions, Selection, load};
use tempfile::TempDir;

const SAVED_FIELDS: [&str; 6] = ["uid", "desc_uid", "mass", "x", "y", "z"];

fn save_catalog(temp_dir: &TempDir) -> Arc<Arbor> {
    let catalog = create_catalog_arbor();
    let output = temp_dir.path().join("catalog");
    catalog.save(SaveOptions::new().filename(&output)).unwrap();
    load(&output, LoadOptions::default()).unwrap()
}

fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (entry.file_name().to_string_lossy().to_string(), fs::read(entry.path()).unwrap())
        })
        .collect()
}

fn save_error(result: Result<Option<std::path::PathBuf>, ArborError>) -> SaveError {
    match result {
        Err(ArborError::Save(err)) => err,
        other => panic!("expected a save error, got {other:?}"),
    }
}

#[test]
fn test_save_and_reload_preserves_forests() {
    let temp_dir = TempDir::new().unwrap();
    let catalog = create_catalog_arbor();
    let loaded = save_catalog(&temp_dir);

    assert!(loaded.is_canonical());
    assert_eq!(loaded.size().unwrap(), 3);
    assert!(loaded.has_field("mass"));
    for entry in 0..3 {
        let original = catalog.root(entry).unwrap();
        let reloaded = loaded.root(entry).unwrap();
        assert_eq!(original.uid(), reloaded.uid());
        for field in SAVED_FIELDS {
            assert_eq!(
                original.selection_field(Selection::Forest, field).unwrap().values,
                reloaded.selection_field(Selection::Forest, field).unwrap().values,
                "{field} of entry {entry}"
            );
        }
        assert_eq!(original.tree_size().unwrap(), reloaded.tree_size().unwrap());
    }
    assert_eq!(loaded.field_info("mass").unwrap().units_str(), "Msun");

    let prog: Vec<i64> = loaded.root(2).unwrap().prog().unwrap().map(|node| node.unwrap().uid()).collect();
    assert_eq!(prog, vec![30, 31, 32]);
}

#[test]
fn test_shards_split_by_size() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("small");
    create_catalog_arbor().save(SaveOptions::new().filename(&output).max_file_size(3)).unwrap();

    let backend = CanonicalBackend::open(&output).unwrap();
    let shards = &backend.header().shards;
    assert_eq!(shards.len(), 2);
    assert_eq!(shards[0].tree_sizes, vec![3]);
    assert_eq!(shards[1].tree_sizes, vec![1, 4]);

    let loaded = load(&output, LoadOptions::default()).unwrap();
    assert_eq!(loaded.root(2).unwrap().uids().unwrap(), vec![30, 31, 32, 33]);
}

#[test]
fn test_analysis_fields_saved_with_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let catalog = create_catalog_arbor();
    catalog.add_analysis_field("score", "", -1.0, DataType::Float).unwrap();
    let roots = catalog.roots(0..3).unwrap();
    roots[0].set("score", 3.0).unwrap();

    let output = temp_dir.path().join("scored");
    catalog.save(SaveOptions::new().filename(&output).trees(roots)).unwrap();

    let loaded = load(&output, LoadOptions::default()).unwrap();
    assert_eq!(loaded.analysis_field_list(), vec!["score".to_string()]);
    assert_eq!(loaded.field("score").unwrap().as_f64_vec().unwrap(), vec![3.0, -1.0, -1.0]);
    assert!(matches!(loaded.field_info("score").unwrap().kind, FieldKind::Analysis { default, .. } if default == -1.0));
}

#[test]
fn test_in_place_update() {
    let temp_dir = TempDir::new().unwrap();
    let loaded = save_catalog(&temp_dir);
    assert_eq!(loaded.save(SaveOptions::new()).unwrap(), None);

    loaded.add_analysis_field("score", "", -1.0, DataType::Float).unwrap();
    let roots = loaded.roots(0..3).unwrap();
    for (i, root) in roots.iter().enumerate() {
        root.set("score", 10.0 * (i + 1) as f64).unwrap();
    }
    roots[2].get_node(Selection::Forest, 1).unwrap().set("score", 5.5).unwrap();

    let written = loaded.save(SaveOptions::new().trees(roots.clone())).unwrap();
    assert_eq!(written.as_deref(), loaded.backend().source_path());

    let directory = temp_dir.path().join("catalog");
    let first = snapshot(&directory);
    loaded.save(SaveOptions::new().trees(roots)).unwrap();
    assert_eq!(first, snapshot(&directory));

    let reloaded = load(&directory, LoadOptions::default()).unwrap();
    assert_eq!(reloaded.field("score").unwrap().as_f64_vec().unwrap(), vec![10.0, 20.0, 30.0]);
    let forest = reloaded.root(2).unwrap().selection_field(Selection::Forest, "score").unwrap();
    assert_eq!(forest.as_f64_vec().unwrap(), vec![30.0, 5.5, -1.0, -1.0]);
}

#[test]
fn test_roots_only_update() {
    let temp_dir = TempDir::new().unwrap();
    let loaded = save_catalog(&temp_dir);
    loaded.add_analysis_field("score", "", 0.0, DataType::Float).unwrap();
    let roots = loaded.roots(0..3).unwrap();
    loaded.save(SaveOptions::new().trees(roots)).unwrap();

    let reloaded = load(temp_dir.path().join("catalog"), LoadOptions::default()).unwrap();
    let root = reloaded.root(1).unwrap();
    root.set("score", 42.0).unwrap();
    reloaded.save(SaveOptions::new().roots_only(true).trees(vec![root])).unwrap();

    let updated = load(temp_dir.path().join("catalog"), LoadOptions::default()).unwrap();
    assert_eq!(updated.field("score").unwrap().as_f64_vec().unwrap(), vec![0.0, 42.0, 0.0]);
    assert_eq!(updated.root(1).unwrap().get_f64("score").unwrap(), 42.0);
}

#[test]
fn test_conflicting_save_options() {
    let temp_dir = TempDir::new().unwrap();
    let loaded = save_catalog(&temp_dir);
    loaded.add_analysis_field("score", "", 0.0, DataType::Float).unwrap();
    let root = loaded.root(0).unwrap();

    assert_eq!(save_error(loaded.save(SaveOptions::new().in_place(true).trees(vec![root]))), SaveError::InPlaceWithSubset);
    assert_eq!(save_error(loaded.save(SaveOptions::new().in_place(true).roots_only(true))), SaveError::InPlaceWithRootsOnly);
    assert_eq!(
        save_error(loaded.save(SaveOptions::new().in_place(true).filename(temp_dir.path().join("elsewhere")))),
        SaveError::InPlaceWithFilename
    );
    assert_eq!(
        save_error(loaded.save(SaveOptions::new().filename(temp_dir.path().join("catalog")).fields(["mass"]))),
        SaveError::OverwritesSource
    );
    assert_eq!(save_error(create_catalog_arbor().save(SaveOptions::new().in_place(true))), SaveError::InPlaceNotCanonical);
    // Nothing was written by the rejected saves.
    assert!(!temp_dir.path().join("elsewhere").exists());
}

#[test]
fn test_save_tree_starts_a_new_root() {
    let temp_dir = TempDir::new().unwrap();
    let catalog = create_catalog_arbor();
    let branch = catalog.root(2).unwrap().get_node(Selection::Forest, 1).unwrap();
    assert_eq!(branch.uid(), 31);

    let output = temp_dir.path().join("branch");
    branch.save_tree(&output, None).unwrap();

    let loaded = load(&output, LoadOptions::default()).unwrap();
    assert_eq!(loaded.size().unwrap(), 1);
    let root = loaded.root(0).unwrap();
    assert_eq!(root.uids().unwrap(), vec![31, 32]);
    assert_eq!(root.desc_uid().unwrap(), -1);
    assert_eq!(root.get_f64("mass").unwrap(), 11.0);
}

#[test]
fn test_csv_catalog_loads_and_converts() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("trees.csv");
    fs::write(&path, "#uid,desc_uid,mass\n#int,int,float\n#None,None,Msun\n1,-1,10.0\n2,1,6.0\n3,1,4.0\n4,2,1.0\n").unwrap();

    let arbor = load(&path, LoadOptions::default()).unwrap();
    assert_eq!(arbor.size().unwrap(), 1);
    let prog: Vec<i64> = arbor.root(0).unwrap().prog().unwrap().map(|node| node.unwrap().uid()).collect();
    assert_eq!(prog, vec![1, 2, 4]);

    let output = temp_dir.path().join("converted");
    arbor.save(SaveOptions::new().filename(&output)).unwrap();
    let converted = load(&output, LoadOptions::default()).unwrap();
    assert_eq!(converted.field("mass").unwrap().as_f64_vec().unwrap(), vec![10.0]);
    assert_eq!(converted.root(0).unwrap().tree_size().unwrap(), 4);
}
