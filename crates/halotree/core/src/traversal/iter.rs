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

//! Lazy node iterators

use std::sync::Arc;

use super::selector::Selector;
use crate::error::{ArborResult, GraphError};
use crate::graph::{Arbor, ForestLinks, Node};

/// Depth-first pre-order over a tree, ancestors in storage order
pub struct TreeNodes {
    origin: Node,
    links: Arc<ForestLinks>,
    stack: Vec<usize>,
}

impl TreeNodes {
    pub(crate) fn new(origin: Node, links: Arc<ForestLinks>) -> Self {
        let stack = vec![origin.tree_id()];
        Self { origin, links, stack }
    }
}

impl Iterator for TreeNodes {
    type Item = Node;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.stack.pop()?;
        self.stack.extend(self.links.ancestors(row).iter().rev());
        Some(self.origin.at_row(&self.links, row))
    }
}

/// Every node of a forest block in storage order
pub struct ForestNodes {
    origin: Node,
    links: Arc<ForestLinks>,
    next: usize,
}

impl ForestNodes {
    pub(crate) fn new(origin: Node, links: Arc<ForestLinks>) -> Self {
        Self { origin, links, next: 0 }
    }
}

impl Iterator for ForestNodes {
    type Item = Node;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.links.len() {
            return None;
        }
        let node = self.origin.at_row(&self.links, self.next);
        self.next += 1;
        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.links.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

/// The main progenitor line, one selector call per step
///
/// A step is taken only when the following node is requested.
pub struct ProgNodes {
    current: Option<Node>,
    previous: Option<Node>,
    selector: Arc<dyn Selector>,
}

impl ProgNodes {
    pub(crate) fn new(start: Node, selector: Arc<dyn Selector>) -> Self {
        Self {
            current: Some(start),
            previous: None,
            selector,
        }
    }

    fn step(&self, node: &Node) -> ArborResult<Option<Node>> {
        let ancestors = node.ancestors()?;
        if ancestors.is_empty() {
            return Ok(None);
        }
        let index = self.selector.select(&ancestors)?;
        let len = ancestors.len();
        match ancestors.into_iter().nth(index) {
            Some(next) => Ok(Some(next)),
            None => Err(GraphError::SelectorOutOfRange {
                selector: self.selector.name().to_string(),
                index,
                len,
            }
            .into()),
        }
    }
}

impl Iterator for ProgNodes {
    type Item = ArborResult<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(previous) = self.previous.take() {
            match self.step(&previous) {
                Ok(next) => self.current = next,
                Err(err) => return Some(Err(err)),
            }
        }
        let node = self.current.take()?;
        self.previous = Some(node.clone());
        Some(Ok(node))
    }
}

/// Root nodes of an arbor, created on demand
pub struct RootNodes {
    arbor: Arc<Arbor>,
    next: usize,
    end: usize,
}

impl RootNodes {
    pub(crate) fn new(arbor: Arc<Arbor>, end: usize) -> Self {
        Self { arbor, next: 0, end }
    }
}

impl Iterator for RootNodes {
    type Item = ArborResult<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let root = self.arbor.root(self.next);
        self.next += 1;
        Some(root)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use halotree_common::Uid;

    use crate::backend::MemoryBackend;
    use crate::fields::FieldValues;
    use crate::graph::{Arbor, Node};

    fn create_test_root() -> Node {
        // 1 <- {2, 3}, 2 <- {4, 5}
        let backend = MemoryBackend::builder("iter")
            .column("uid", FieldValues::Int(vec![1, 2, 3, 4, 5]), "")
            .column("desc_uid", FieldValues::Int(vec![-1, 1, 1, 2, 2]), "")
            .column("mass", FieldValues::Float(vec![20.0, 8.0, 8.0, 2.0, 5.0]), "Msun")
            .build()
            .unwrap();
        Arbor::new(backend).unwrap().root(0).unwrap()
    }

    #[test]
    fn test_tree_iteration_is_repeatable() {
        let root = create_test_root();
        let first: Vec<Uid> = root.tree().unwrap().map(|n| n.uid()).collect();
        let second: Vec<Uid> = root.tree().unwrap().map(|n| n.uid()).collect();
        assert_eq!(first, vec![1, 2, 4, 5, 3]);
        assert_eq!(first, second);
        assert_eq!(root.forest().unwrap().count(), 5);
    }

    #[test]
    fn test_prog_ties_pick_first() {
        let root = create_test_root();
        let line: Vec<Uid> = root.prog().unwrap().map(|n| n.unwrap().uid()).collect();
        // 2 and 3 tie on mass: the first in storage order wins.
        assert_eq!(line, vec![1, 2, 5]);
    }
}
