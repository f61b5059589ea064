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

use common::*;
use halotree_core::backend::{MemoryBackend, MissingDescendantPolicy};
use halotree_core::{Arbor, ArborError, GraphError, Selection};
use proptest::prelude::*;

#[test]
fn test_worked_example_follows_heavier_branch() {
    // Node 4 descends into node 2, so the heavier 2 leads on to 4.
    let arbor = create_worked_arbor([10.0, 6.0, 4.0, 1.0]);
    assert_eq!(arbor.size().unwrap(), 1);

    let root = arbor.root(0).unwrap();
    assert_eq!(root.uid(), 1);
    assert!(root.is_root());
    assert_eq!(root.tree_size().unwrap(), 4);

    let mut ancestors = uids(&root.ancestors().unwrap());
    ancestors.sort();
    assert_eq!(ancestors, vec![2, 3]);

    let prog: Vec<i64> = root.prog().unwrap().map(|node| node.unwrap().uid()).collect();
    assert_eq!(prog, vec![1, 2, 4]);
}

#[test]
fn test_worked_example_stops_on_leaf_branch() {
    let arbor = create_worked_arbor([10.0, 4.0, 6.0, 1.0]);
    let prog: Vec<i64> = arbor.root(0).unwrap().prog().unwrap().map(|node| node.unwrap().uid()).collect();
    assert_eq!(prog, vec![1, 3]);
}

#[test]
fn test_descendant_ancestor_reciprocity() {
    let arbor = create_catalog_arbor();
    for root in arbor.iter().unwrap() {
        let root = root.unwrap();
        for node in root.forest().unwrap() {
            match node.descendant().unwrap() {
                Some(descendant) => assert!(descendant.ancestors().unwrap().contains(&node)),
                None => assert!(node.is_root()),
            }
        }
    }
}

#[test]
fn test_tree_size_matches_traversal() {
    let arbor = create_catalog_arbor();
    let sizes: Vec<usize> = arbor.iter().unwrap().map(|root| root.unwrap().tree_size().unwrap()).collect();
    assert_eq!(sizes, vec![3, 1, 4]);

    for index in 0..arbor.size().unwrap() {
        let root = arbor.root(index).unwrap();
        let first = root.tree().unwrap().count();
        let second = root.tree().unwrap().count();
        assert_eq!(first, root.tree_size().unwrap());
        assert_eq!(first, second);

        // Re-indexing gives a new instance; the cached size still agrees.
        let again = arbor.root(index).unwrap();
        assert!(!again.same_instance(&root));
        assert_eq!(again, root);
        assert_eq!(again.tree_size().unwrap(), first);
    }
}

#[test]
fn test_subtree_traversal_order() {
    let arbor = create_catalog_arbor();
    let root = arbor.root(2).unwrap();
    assert_eq!(uids(&root.tree().unwrap().collect::<Vec<_>>()), vec![30, 31, 32, 33]);

    let branch = root.get_node(Selection::Tree, 1).unwrap();
    assert_eq!(branch.uid(), 31);
    assert!(!branch.is_root());
    assert_eq!(branch.tree_size().unwrap(), 2);
    assert_eq!(branch.find_root().unwrap().uid(), 30);
    assert_eq!(uids(&branch.get_leaf_nodes(None).unwrap()), vec![32]);
    assert_eq!(uids(&root.get_leaf_nodes(None).unwrap()), vec![32, 33]);
}

#[test]
fn test_dangling_descendant_is_reported() {
    let backend = MemoryBackend::builder("dangling")
        .column("uid", ints(&[1, 2]), "")
        .column("desc_uid", ints(&[-1, 99]), "")
        .build()
        .unwrap();
    let arbor = Arbor::new(backend).unwrap();
    let errors: Vec<ArborError> = arbor.iter().unwrap().filter_map(|root| root.and_then(|r| r.tree_size()).err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ArborError::Graph(GraphError::DanglingDescendant { uid: 2, desc_uid: 99, .. })));
}

#[test]
fn test_reassignment_is_a_diagnostic() {
    let backend = MemoryBackend::builder("fallback")
        .column("uid", ints(&[1, 2, 3]), "")
        .column("desc_uid", ints(&[-1, 1, 77]), "")
        .column("next_desc_uid", ints(&[-1, -1, 2]), "")
        .missing_descendants(MissingDescendantPolicy::Fallback { field: "next_desc_uid".to_string() })
        .build()
        .unwrap();
    let arbor = Arbor::new(backend).unwrap();
    assert_eq!(arbor.size().unwrap(), 1);

    let reassignments = arbor.reassignments().unwrap();
    assert_eq!(reassignments.len(), 1);
    assert_eq!((reassignments[0].uid, reassignments[0].old_desc_uid, reassignments[0].new_desc_uid), (3, 77, 2));
    assert_eq!(arbor.root(0).unwrap().tree_size().unwrap(), 3);
}

#[test]
fn test_forest_access_groups_roots() {
    let backend = MemoryBackend::builder("forests")
        .column("uid", ints(&[1, 2, 3, 4]), "")
        .column("desc_uid", ints(&[-1, 1, -1, 3]), "")
        .column("forest_id", ints(&[7, 7, 7, 7]), "")
        .forest_field("forest_id")
        .build()
        .unwrap();
    let arbor = Arbor::new(backend).unwrap();
    assert_eq!(arbor.size().unwrap(), 1);

    let entry = arbor.root(0).unwrap();
    assert_eq!(uids(&entry.get_root_nodes().unwrap()), vec![1, 3]);
    assert_eq!(entry.forest().unwrap().count(), 4);
    assert_eq!(entry.tree().unwrap().count(), 2);
}

/// Descendant links for `count` halos where halo `i > 0` descends into an earlier halo.
fn forest_strategy() -> impl Strategy<Value = Vec<i64>> {
    (1usize..40).prop_flat_map(|count| {
        let parents: Vec<BoxedStrategy<i64>> = (0..count).map(|i| if i == 0 { Just(-1i64).boxed() } else { (0..i as i64).prop_map(|p| p + 1).boxed() }).collect();
        parents
    })
}

proptest! {
    #[test]
    fn prop_random_forests_are_consistent(desc in forest_strategy()) {
        let uid: Vec<i64> = (1..=desc.len() as i64).collect();
        let masses: Vec<f64> = uid.iter().map(|u| ((u * 37) % 11) as f64).collect();
        let backend = MemoryBackend::builder("random")
            .column("uid", ints(&uid), "")
            .column("desc_uid", ints(&desc), "")
            .column("mass", floats(&masses), "Msun")
            .build()
            .unwrap();
        let arbor = Arbor::new(backend).unwrap();
        prop_assert_eq!(arbor.size().unwrap(), 1);

        let root = arbor.root(0).unwrap();
        let size = root.tree_size().unwrap();
        prop_assert_eq!(size, desc.len());
        prop_assert_eq!(root.tree().unwrap().count(), size);

        for node in root.forest().unwrap() {
            if let Some(descendant) = node.descendant().unwrap() {
                prop_assert!(descendant.ancestors().unwrap().contains(&node));
            }
        }

        let mut steps = 0;
        let mut current = root.clone();
        for node in root.prog().unwrap() {
            let node = node.unwrap();
            if steps > 0 {
                prop_assert!(current.ancestors().unwrap().contains(&node));
            }
            current = node;
            steps += 1;
        }
        prop_assert!(steps <= size);
        prop_assert!(current.ancestors().unwrap().is_empty());
    }
}
