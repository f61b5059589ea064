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

//! Traversal and selection
//!
//! Three orderings are defined over the nodes related to a given node: its
//! tree (depth-first pre-order over ancestors), its forest (storage order of
//! the whole block) and its progenitor line (repeatedly choosing one ancestor
//! with the arbor's [`Selector`]).

pub mod iter;
pub mod query;
pub mod selector;

pub use iter::*;
pub use query::*;
pub use selector::*;

use std::fmt;
use std::str::FromStr;

/// Named node orderings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selection {
    Tree,
    Forest,
    Prog,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Tree => write!(f, "tree"),
            Selection::Forest => write!(f, "forest"),
            Selection::Prog => write!(f, "prog"),
        }
    }
}

impl FromStr for Selection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tree" => Ok(Selection::Tree),
            "forest" => Ok(Selection::Forest),
            "prog" => Ok(Selection::Prog),
            other => Err(format!("unknown selection '{other}', expected tree, forest or prog")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_names() {
        for selection in [Selection::Tree, Selection::Forest, Selection::Prog] {
            assert_eq!(selection.to_string().parse::<Selection>().unwrap(), selection);
        }
        assert!("branch".parse::<Selection>().is_err());
    }
}
