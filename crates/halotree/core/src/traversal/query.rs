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

//! Halo search
//!
//! Predicates are plain data. A [`HaloSelection`] walks the requested trees
//! one at a time, fetches every field the predicate (and the preload list)
//! names for the whole selection in one pass and yields the matching nodes.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::Not;
use std::sync::Arc;

use tracing::trace;

use super::Selection;
use crate::error::{ArborResult, FieldError};
use crate::fields::FieldArray;
use crate::graph::{Arbor, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
            Comparison::Eq => left == right,
            Comparison::Ne => left != right,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        };
        write!(f, "{symbol}")
    }
}

/// A field reference, optionally converted into other units before comparing
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldRef {
    pub field: String,
    pub units: Option<String>,
}

impl FieldRef {
    pub fn in_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn gt(self, value: f64) -> Predicate {
        self.compare(Comparison::Gt, value)
    }

    pub fn ge(self, value: f64) -> Predicate {
        self.compare(Comparison::Ge, value)
    }

    pub fn lt(self, value: f64) -> Predicate {
        self.compare(Comparison::Lt, value)
    }

    pub fn le(self, value: f64) -> Predicate {
        self.compare(Comparison::Le, value)
    }

    pub fn eq(self, value: f64) -> Predicate {
        self.compare(Comparison::Eq, value)
    }

    pub fn ne(self, value: f64) -> Predicate {
        self.compare(Comparison::Ne, value)
    }

    /// Matches values within `tolerance` (relative) of `value`.
    pub fn about(self, value: f64, tolerance: f64) -> Predicate {
        Predicate::About {
            field: self,
            value,
            tolerance,
        }
    }

    pub fn compare(self, op: Comparison, value: f64) -> Predicate {
        Predicate::Compare { field: self, op, value }
    }
}

/// Typed halo search criteria
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare { field: FieldRef, op: Comparison, value: f64 },
    About { field: FieldRef, value: f64, tolerance: f64 },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn field(name: impl Into<String>) -> FieldRef {
        FieldRef { field: name.into(), units: None }
    }

    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Or(mut any) => {
                any.push(other);
                Predicate::Or(any)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Every field reference, deduplicated.
    pub fn fields(&self) -> Vec<FieldRef> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields.sort();
        fields.dedup();
        fields
    }

    fn collect_fields(&self, out: &mut Vec<FieldRef>) {
        match self {
            Predicate::Compare { field, .. } | Predicate::About { field, .. } => out.push(field.clone()),
            Predicate::And(all) | Predicate::Or(all) => all.iter().for_each(|p| p.collect_fields(out)),
            Predicate::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Evaluates row `row` of pre-fetched columns.
    pub fn matches(&self, columns: &BTreeMap<FieldRef, Vec<f64>>, row: usize) -> bool {
        let value = |field: &FieldRef| columns.get(field).and_then(|c| c.get(row)).copied().unwrap_or(f64::NAN);
        match self {
            Predicate::Compare { field, op, value: target } => op.holds(value(field), *target),
            Predicate::About { field, value: target, tolerance } => {
                let scale = if *target == 0.0 { 1.0 } else { target.abs() };
                (value(field) - target).abs() <= tolerance * scale
            }
            Predicate::And(all) => all.iter().all(|p| p.matches(columns, row)),
            Predicate::Or(any) => any.iter().any(|p| p.matches(columns, row)),
            Predicate::Not(inner) => !inner.matches(columns, row),
        }
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Self::Output {
        Predicate::Not(Box::new(self))
    }
}

/// Values of `field` along `selection`, converted into the requested units.
fn predicate_column(tree: &Node, selection: Selection, field: &FieldRef) -> ArborResult<Vec<f64>> {
    let mut array: FieldArray = tree.selection_field(selection, &field.field)?;
    if let Some(units) = &field.units {
        let target = tree.arbor().unit_system().parse(units).map_err(|source| FieldError::Units {
            field: field.field.clone(),
            source,
        })?;
        array = array.to_units(&target).map_err(|_| FieldError::DimensionMismatch {
            field: field.field.clone(),
            from: array.units.expr().to_string(),
            to: units.clone(),
        })?;
    }
    array.as_f64_vec().ok_or_else(|| FieldError::NotScalar { field: field.field.clone() }.into())
}

enum TreeSource {
    Arbor { arbor: Arc<Arbor>, next: usize, end: usize },
    Trees(std::vec::IntoIter<Node>),
}

impl TreeSource {
    fn next_tree(&mut self) -> Option<ArborResult<Node>> {
        match self {
            TreeSource::Arbor { arbor, next, end } => {
                if *next >= *end {
                    return None;
                }
                let root = arbor.root(*next);
                *next += 1;
                Some(root)
            }
            TreeSource::Trees(trees) => trees.next().map(Ok),
        }
    }
}

/// Streaming search over trees
pub struct HaloSelection {
    source: TreeSource,
    predicate: Predicate,
    selection: Selection,
    preload: Vec<String>,
    matched: VecDeque<Node>,
}

impl HaloSelection {
    /// Restricts the search to `trees` instead of every root of the arbor.
    pub fn trees(mut self, trees: Vec<Node>) -> Self {
        self.source = TreeSource::Trees(trees.into_iter());
        self
    }

    fn search(&self, tree: &Node) -> ArborResult<Vec<Node>> {
        let mut fetch: Vec<String> = self.predicate.fields().into_iter().map(|f| f.field).collect();
        fetch.extend(self.preload.iter().cloned());
        tree.preload(&fetch)?;

        let mut columns = BTreeMap::new();
        for field in self.predicate.fields() {
            let column = predicate_column(tree, self.selection, &field)?;
            columns.insert(field, column);
        }

        let nodes = tree.selection_nodes(self.selection)?;
        let matched: Vec<Node> = nodes.into_iter().enumerate().filter(|(row, _)| self.predicate.matches(&columns, *row)).map(|(_, node)| node).collect();
        trace!("{} of tree {} matched", matched.len(), tree);
        Ok(matched)
    }
}

impl Iterator for HaloSelection {
    type Item = ArborResult<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.matched.pop_front() {
                return Some(Ok(node));
            }
            let tree = match self.source.next_tree()? {
                Ok(tree) => tree,
                Err(err) => return Some(Err(err)),
            };
            match self.search(&tree) {
                Ok(found) => self.matched.extend(found),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl Arbor {
    /// Nodes matching `predicate` along `selection` of every root, streamed tree by tree.
    pub fn select_halos(self: &Arc<Self>, predicate: Predicate, selection: Selection, preload: &[&str]) -> ArborResult<HaloSelection> {
        let end = self.size()?;
        Ok(HaloSelection {
            source: TreeSource::Arbor {
                arbor: self.clone(),
                next: 0,
                end,
            },
            predicate,
            selection,
            preload: preload.iter().map(|f| f.to_string()).collect(),
            matched: VecDeque::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use halotree_common::Uid;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::fields::FieldValues;

    fn create_test_arbor() -> Arc<Arbor> {
        let backend = MemoryBackend::builder("query")
            .column("uid", FieldValues::Int(vec![1, 2, 3, 10, 11]), "")
            .column("desc_uid", FieldValues::Int(vec![-1, 1, 1, -1, 10]), "")
            .column("mass", FieldValues::Float(vec![10.0, 4.0, 6.0, 3.0, 2.0]), "Msun")
            .build()
            .unwrap();
        Arbor::new(backend).unwrap()
    }

    fn uids(selection: HaloSelection) -> Vec<Uid> {
        selection.map(|node| node.unwrap().uid()).collect()
    }

    #[test]
    fn test_compare_and_combinators() {
        let arbor = create_test_arbor();
        let heavy = Predicate::field("mass").gt(3.5);
        assert_eq!(uids(arbor.select_halos(heavy.clone(), Selection::Tree, &[]).unwrap()), vec![1, 2, 3]);

        let window = Predicate::field("mass").ge(3.0).and(Predicate::field("mass").lt(6.0));
        assert_eq!(uids(arbor.select_halos(window, Selection::Tree, &[]).unwrap()), vec![2, 10]);

        assert_eq!(uids(arbor.select_halos(!heavy, Selection::Tree, &[]).unwrap()), vec![10, 11]);
    }

    #[test]
    fn test_units_and_about() {
        let arbor = create_test_arbor();
        let grams = Predicate::field("mass").in_units("g").about(6.0 * halotree_common::MSUN_G, 1e-9);
        assert_eq!(uids(arbor.select_halos(grams, Selection::Tree, &[]).unwrap()), vec![3]);

        let wrong = Predicate::field("mass").in_units("kpc").gt(1.0);
        let mut search = arbor.select_halos(wrong, Selection::Tree, &[]).unwrap();
        assert!(matches!(search.next(), Some(Err(crate::ArborError::Field(FieldError::DimensionMismatch { .. })))));
    }

    #[test]
    fn test_restrict_to_trees() {
        let arbor = create_test_arbor();
        let trees = vec![arbor.root(1).unwrap()];
        let search = arbor.select_halos(Predicate::field("mass").gt(0.0), Selection::Forest, &["mass"]).unwrap().trees(trees);
        assert_eq!(uids(search), vec![10, 11]);
    }

    #[test]
    fn test_fields_are_deduplicated() {
        let predicate = Predicate::field("mass").gt(1.0).or(Predicate::field("mass").lt(0.5)).and(Predicate::field("Rvir").eq(1.0));
        let names: Vec<String> = predicate.fields().into_iter().map(|f| f.field).collect();
        assert_eq!(names, vec!["Rvir".to_string(), "mass".to_string()]);
    }
}
