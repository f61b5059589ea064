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

//! Descendant and ancestor links of one forest block

use std::collections::HashMap;

use halotree_common::{NO_DESCENDANT, Uid};

use crate::error::GraphError;

/// Row-indexed links of a forest, built once from its uid columns
#[derive(Debug, Clone)]
pub struct ForestLinks {
    uids: Vec<Uid>,
    desc_uids: Vec<Uid>,
    index: HashMap<Uid, usize>,
    descendant: Vec<Option<usize>>,
    ancestors: Vec<Vec<usize>>,
}

impl ForestLinks {
    /// Links the rows of forest `entry`. Every non-sentinel `desc_uid` must name a uid of the same forest.
    pub fn build(entry: usize, uids: Vec<Uid>, desc_uids: Vec<Uid>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(uids.len());
        for (row, uid) in uids.iter().enumerate() {
            if index.insert(*uid, row).is_some() {
                return Err(GraphError::DuplicateUid { entry, uid: *uid });
            }
        }

        let mut descendant = vec![None; uids.len()];
        let mut ancestors = vec![Vec::new(); uids.len()];
        for (row, desc_uid) in desc_uids.iter().enumerate() {
            if *desc_uid == NO_DESCENDANT {
                continue;
            }
            let desc_row = *index.get(desc_uid).ok_or(GraphError::DanglingDescendant {
                entry,
                uid: uids[row],
                desc_uid: *desc_uid,
            })?;
            descendant[row] = Some(desc_row);
            ancestors[desc_row].push(row);
        }

        Ok(Self {
            uids,
            desc_uids,
            index,
            descendant,
            ancestors,
        })
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn uid(&self, row: usize) -> Uid {
        self.uids[row]
    }

    pub fn desc_uid(&self, row: usize) -> Uid {
        self.desc_uids[row]
    }

    pub fn uids(&self) -> &[Uid] {
        &self.uids
    }

    pub fn desc_uids(&self) -> &[Uid] {
        &self.desc_uids
    }

    pub fn row_of(&self, uid: Uid) -> Option<usize> {
        self.index.get(&uid).copied()
    }

    pub fn descendant(&self, row: usize) -> Option<usize> {
        self.descendant[row]
    }

    /// Ancestor rows in storage order.
    pub fn ancestors(&self, row: usize) -> &[usize] {
        &self.ancestors[row]
    }

    pub fn is_root(&self, row: usize) -> bool {
        self.descendant[row].is_none()
    }

    pub fn roots(&self) -> Vec<usize> {
        (0..self.len()).filter(|row| self.is_root(*row)).collect()
    }

    /// Rows of the tree under `row`, depth-first pre-order.
    pub fn tree_rows(&self, row: usize) -> Vec<usize> {
        let mut rows = Vec::new();
        let mut stack = vec![row];
        while let Some(current) = stack.pop() {
            rows.push(current);
            stack.extend(self.ancestors[current].iter().rev());
        }
        rows
    }

    /// Rows of `rows` without ancestors.
    pub fn leaves(&self, rows: &[usize]) -> Vec<usize> {
        rows.iter().copied().filter(|row| self.ancestors[*row].is_empty()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_links() -> ForestLinks {
        // 1 <- {2, 3}, 2 <- 4
        ForestLinks::build(0, vec![1, 2, 3, 4], vec![-1, 1, 1, 2]).unwrap()
    }

    #[test]
    fn test_links_are_reciprocal() {
        let links = create_test_links();
        for row in 0..links.len() {
            if let Some(desc) = links.descendant(row) {
                assert!(links.ancestors(desc).contains(&row));
            }
            for ancestor in links.ancestors(row) {
                assert_eq!(links.descendant(*ancestor), Some(row));
            }
        }
        assert_eq!(links.roots(), vec![0]);
    }

    #[test]
    fn test_tree_rows_pre_order() {
        let links = create_test_links();
        assert_eq!(links.tree_rows(0), vec![0, 1, 3, 2]);
        assert_eq!(links.tree_rows(1), vec![1, 3]);
        assert_eq!(links.leaves(&links.tree_rows(0)), vec![3, 2]);
        assert_eq!(links.row_of(4), Some(3));
    }

    #[test]
    fn test_dangling_descendant() {
        let err = ForestLinks::build(7, vec![1, 2], vec![-1, 5]).unwrap_err();
        assert!(matches!(err, GraphError::DanglingDescendant { entry: 7, uid: 2, desc_uid: 5 }));
    }

    #[test]
    fn test_duplicate_uid() {
        let err = ForestLinks::build(0, vec![1, 1], vec![-1, -1]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateUid { uid: 1, .. }));
    }
}
