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

//! Halo handles
//!
//! A [`Node`] is a cheap value: the arbor, the forest instance it was reached
//! through and its row in that forest's block. Two nodes are equal when they
//! name the same uid of the same arbor, whatever instance they came from.

use std::fmt;
use std::sync::Arc;

use halotree_common::Uid;

use super::arbor::Arbor;
use super::forest::Forest;
use super::links::ForestLinks;
use crate::error::{ArborResult, FieldError, GraphError};
use crate::fields::{FieldArray, FieldValue, FieldValues, Quantity};
use crate::traversal::{ForestNodes, ProgNodes, Selection, TreeNodes};

#[derive(Clone)]
pub struct Node {
    arbor: Arc<Arbor>,
    forest: Arc<Forest>,
    row: usize,
    uid: Uid,
}

impl Node {
    pub(crate) fn new(arbor: Arc<Arbor>, forest: Arc<Forest>, row: usize, uid: Uid) -> Self {
        Self { arbor, forest, row, uid }
    }

    /// Node of the same forest instance at `row`.
    pub(crate) fn at_row(&self, links: &ForestLinks, row: usize) -> Node {
        Node::new(self.arbor.clone(), self.forest.clone(), row, links.uid(row))
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn arbor(&self) -> &Arc<Arbor> {
        &self.arbor
    }

    pub(crate) fn forest_state(&self) -> &Arc<Forest> {
        &self.forest
    }

    /// Entry index of the forest this node belongs to.
    pub fn arbor_index(&self) -> usize {
        self.forest.entry()
    }

    /// Row of this node within its forest block.
    pub fn tree_id(&self) -> usize {
        self.row
    }

    /// True if this node has no descendant.
    pub fn is_root(&self) -> bool {
        self.row == 0 || self.forest.cached_links().is_some_and(|links| links.is_root(self.row))
    }

    /// True if both handles share the same forest instance and row.
    pub fn same_instance(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.forest, &other.forest) && self.row == other.row
    }

    pub fn links(&self) -> ArborResult<Arc<ForestLinks>> {
        self.forest.links(&self.arbor)
    }

    pub fn desc_uid(&self) -> ArborResult<Uid> {
        Ok(self.links()?.desc_uid(self.row))
    }

    /// Uids of every node in the forest, in storage order.
    pub fn uids(&self) -> ArborResult<Vec<Uid>> {
        Ok(self.links()?.uids().to_vec())
    }

    pub fn desc_uids(&self) -> ArborResult<Vec<Uid>> {
        Ok(self.links()?.desc_uids().to_vec())
    }

    pub fn descendant(&self) -> ArborResult<Option<Node>> {
        let links = self.links()?;
        Ok(links.descendant(self.row).map(|row| self.at_row(&links, row)))
    }

    /// Direct progenitors in storage order. Empty for a leaf.
    pub fn ancestors(&self) -> ArborResult<Vec<Node>> {
        let links = self.links()?;
        Ok(links.ancestors(self.row).iter().map(|row| self.at_row(&links, *row)).collect())
    }

    /// Follows descendants to the final halo of this tree.
    pub fn find_root(&self) -> ArborResult<Node> {
        let links = self.links()?;
        let mut row = self.row;
        while let Some(desc) = links.descendant(row) {
            row = desc;
        }
        Ok(self.at_row(&links, row))
    }

    /// Number of nodes in the tree under this node, itself included.
    pub fn tree_size(&self) -> ArborResult<usize> {
        let cached = if self.row == 0 { self.arbor.cached_tree_size(self.arbor_index()) } else { self.forest.tree_size(self.row) };
        if let Some(size) = cached {
            return Ok(size);
        }

        let size = self.links()?.tree_rows(self.row).len();
        if self.row == 0 {
            self.arbor.store_tree_size(self.arbor_index(), size);
        } else {
            self.forest.store_tree_size(self.row, size);
        }
        Ok(size)
    }

    /// Value of `field` for this node.
    pub fn get(&self, field: &str) -> ArborResult<Quantity> {
        let row = self.row;
        let len = self.forest.len();
        self.forest.with_column(&self.arbor, field, |column| column.value_at(row))?.ok_or_else(|| {
            GraphError::NodeIndexOutOfRange {
                selection: Selection::Forest,
                index: row,
                len,
            }
            .into()
        })
    }

    /// Scalar value of `field` in its native units.
    pub fn get_f64(&self, field: &str) -> ArborResult<f64> {
        self.get(field)?.as_f64().ok_or_else(|| FieldError::NotScalar { field: field.to_string() }.into())
    }

    /// Sets an analysis field. Cached fields computed from it are dropped.
    pub fn set(&self, field: &str, value: impl Into<FieldValue>) -> ArborResult<()> {
        let value = value.into();
        let dependents = {
            let registry = self.arbor.registry();
            match registry.get(field) {
                None => return Err(FieldError::NotFound { field: field.to_string() }.into()),
                Some(definition) if !definition.is_analysis() => return Err(FieldError::Unsettable { field: field.to_string() }.into()),
                Some(_) => registry.dependents_of(field),
            }
        };

        self.forest.set_value(&self.arbor, field, self.row, &value)?;
        self.forest.invalidate(&dependents);
        if self.row == 0 {
            self.arbor.set_root_value(self.arbor_index(), field, &value)?;
            self.arbor.invalidate_root_fields(&dependents);
        }
        Ok(())
    }

    /// Writes collected values of an analysis field into `rows` of this node's forest.
    pub(crate) fn assign_rows(&self, field: &str, rows: &[usize], values: &FieldValues) -> ArborResult<()> {
        let dependents = self.arbor.registry().dependents_of(field);
        self.forest.set_rows(&self.arbor, field, rows, values)?;
        self.forest.invalidate(&dependents);
        if let Some(position) = rows.iter().position(|row| *row == 0)
            && let Some(value) = values.value_at(position)
        {
            self.arbor.set_root_value(self.arbor_index(), field, &value)?;
            self.arbor.invalidate_root_fields(&dependents);
        }
        Ok(())
    }

    /// Forest rows covered by `selection`, in selection order.
    pub fn selection_rows(&self, selection: Selection) -> ArborResult<Vec<usize>> {
        let links = self.links()?;
        match selection {
            Selection::Tree => Ok(links.tree_rows(self.row)),
            Selection::Forest => Ok((0..links.len()).collect()),
            Selection::Prog => self.prog()?.map(|node| node.map(|n| n.row)).collect(),
        }
    }

    pub fn selection_nodes(&self, selection: Selection) -> ArborResult<Vec<Node>> {
        let links = self.links()?;
        Ok(self.selection_rows(selection)?.into_iter().map(|row| self.at_row(&links, row)).collect())
    }

    /// Values of `field` along `selection`.
    pub fn selection_field(&self, selection: Selection, field: &str) -> ArborResult<FieldArray> {
        let rows = self.selection_rows(selection)?;
        let selected = self.forest.with_column(&self.arbor, field, |column| column.select(field, &rows))?;
        Ok(selected?)
    }

    /// Resolves `fields` for the whole forest in one pass.
    pub fn preload(&self, fields: &[String]) -> ArborResult<()> {
        self.forest.resolve(&self.arbor, fields)
    }

    /// Depth-first pre-order over this node and all of its progenitors.
    pub fn tree(&self) -> ArborResult<TreeNodes> {
        Ok(TreeNodes::new(self.clone(), self.links()?))
    }

    /// Every node of the forest in storage order.
    pub fn forest(&self) -> ArborResult<ForestNodes> {
        Ok(ForestNodes::new(self.clone(), self.links()?))
    }

    /// The progenitor line chosen by the arbor's selector.
    pub fn prog(&self) -> ArborResult<ProgNodes> {
        Ok(ProgNodes::new(self.clone(), self.arbor.selector()))
    }

    /// Node at position `index` of `selection`. For forests the index is the storage row.
    ///
    /// Tree and progenitor selections are walked only up to `index`.
    pub fn get_node(&self, selection: Selection, index: usize) -> ArborResult<Node> {
        let out_of_range = |len| GraphError::NodeIndexOutOfRange { selection, index, len };
        let walk: Box<dyn Iterator<Item = ArborResult<Node>>> = match selection {
            Selection::Forest => {
                let links = self.links()?;
                if index >= links.len() {
                    return Err(out_of_range(links.len()).into());
                }
                return Ok(self.at_row(&links, index));
            }
            Selection::Tree => Box::new(self.tree()?.map(Ok)),
            Selection::Prog => Box::new(self.prog()?),
        };
        let mut len = 0;
        for node in walk {
            let node = node?;
            if len == index {
                return Ok(node);
            }
            len += 1;
        }
        Err(out_of_range(len).into())
    }

    /// Nodes without progenitors. Defaults to the forest for entry roots and the tree otherwise.
    pub fn get_leaf_nodes(&self, selection: Option<Selection>) -> ArborResult<Vec<Node>> {
        let selection = selection.unwrap_or(if self.row == 0 { Selection::Forest } else { Selection::Tree });
        let links = self.links()?;
        let rows = self.selection_rows(selection)?;
        Ok(links.leaves(&rows).into_iter().map(|row| self.at_row(&links, row)).collect())
    }

    /// Nodes of the forest without a descendant.
    pub fn get_root_nodes(&self) -> ArborResult<Vec<Node>> {
        let links = self.links()?;
        Ok(links.roots().into_iter().map(|row| self.at_row(&links, row)).collect())
    }

    /// A structurally equal node backed by a fresh forest instance.
    pub fn regenerate(&self) -> ArborResult<Node> {
        let root = self.arbor.root(self.arbor_index())?;
        if self.row == 0 {
            return Ok(root);
        }
        let links = root.links()?;
        Ok(root.at_row(&links, self.row))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.arbor, &other.arbor) && self.uid == other.uid
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("uid", &self.uid).field("arbor_index", &self.arbor_index()).field("tree_id", &self.row).finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeNode[{}]", self.uid)
    }
}
