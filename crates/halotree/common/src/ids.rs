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

//! Halo identifiers

/// Catalog-wide unique halo identifier.
pub type Uid = i64;

/// Descendant id carried by halos that have no descendant (roots).
pub const NO_DESCENDANT: Uid = -1;

/// Returns true if the given descendant id marks a root.
pub fn is_root_descendant(desc_uid: Uid) -> bool {
    desc_uid == NO_DESCENDANT
}
