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

//! Columnar in-memory backend
//!
//! Holds a flat halo catalog as columns. At build time rows are regrouped so
//! that every forest is a contiguous block starting at its root and listed in
//! depth-first order, then split into one or more backing "files".

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use halotree_common::{NO_DESCENDANT, Uid};
use tracing::{debug, warn};

use super::{AliasDeclaration, ArborMetadata, DataBackend, FieldDeclarations, ForestLocation, NativeField, PlantedForests, Reassignment, RowSelection};
use crate::error::{ArborResult, BackendError, GraphError};
use crate::fields::{DataType, FieldValues};

/// What to do with a halo whose descendant is not in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MissingDescendantPolicy {
    /// Keep the link; the graph model reports it as dangling.
    #[default]
    Reject,
    /// Re-point the link to the uid stored in `field`, if that uid exists.
    Fallback { field: String },
    /// Turn the halo into a root.
    PromoteToRoot,
}

/// How rows are grouped into entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// One entry per tree.
    #[default]
    Tree,
    /// One entry per forest id; an entry may hold several roots.
    Forest,
}

/// Builder for [`MemoryBackend`]
#[derive(Debug, Clone)]
pub struct MemoryBackendBuilder {
    name: String,
    columns: Vec<(String, FieldValues, String)>,
    aliases: Vec<AliasDeclaration>,
    forest_field: Option<String>,
    access: AccessMode,
    policy: MissingDescendantPolicy,
    files: usize,
    metadata: ArborMetadata,
}

impl MemoryBackendBuilder {
    pub fn column(mut self, name: impl Into<String>, values: FieldValues, units: impl Into<String>) -> Self {
        self.columns.push((name.into(), values, units.into()));
        self
    }

    pub fn alias(mut self, alias: impl Into<String>, target: impl Into<String>, units: Option<&str>) -> Self {
        self.aliases.push(AliasDeclaration::new(alias, target, units));
        self
    }

    /// Groups rows by the given forest id column and switches to forest access.
    pub fn forest_field(mut self, field: impl Into<String>) -> Self {
        self.forest_field = Some(field.into());
        self.access = AccessMode::Forest;
        self
    }

    pub fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn missing_descendants(mut self, policy: MissingDescendantPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of backing files the entries are spread over.
    pub fn files(mut self, files: usize) -> Self {
        self.files = files.max(1);
        self
    }

    pub fn metadata(mut self, metadata: ArborMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn build(self) -> ArborResult<MemoryBackend> {
        let rows = self.validate()?;
        let uids = self.integer_column("uid")?;
        let mut desc_uids = self.integer_column("desc_uid")?;

        let mut index: HashMap<Uid, usize> = HashMap::with_capacity(rows);
        for (row, uid) in uids.iter().enumerate() {
            if index.insert(*uid, row).is_some() {
                return Err(BackendError::DuplicateUid { uid: *uid }.into());
            }
        }

        let reassignments = self.apply_policy(&uids, &mut desc_uids, &index)?;
        let groups = self.group_rows(&uids, &desc_uids, &index)?;

        let file_count = self.files.min(groups.len()).max(1);
        let mut file_rows: Vec<Vec<usize>> = vec![Vec::new(); file_count];
        let mut locations = Vec::with_capacity(groups.len());
        for (g, group) in groups.iter().enumerate() {
            let file = g * file_count / groups.len().max(1);
            let start = file_rows[file].len();
            file_rows[file].extend_from_slice(group);
            locations.push(ForestLocation {
                file,
                start,
                end: start + group.len(),
                root_uid: uids[group[0]],
            });
        }

        let desc_column = FieldValues::Int(desc_uids);
        let files = file_rows
            .iter()
            .map(|rows| {
                self.columns
                    .iter()
                    .map(|(name, values, _)| {
                        let source = if name == "desc_uid" { &desc_column } else { values };
                        Ok((name.clone(), source.select_rows(name, rows)?))
                    })
                    .collect::<ArborResult<BTreeMap<String, FieldValues>>>()
            })
            .collect::<ArborResult<Vec<_>>>()?;

        let declarations = FieldDeclarations {
            native: self
                .columns
                .iter()
                .map(|(name, values, units)| NativeField::new(name.clone(), units.clone(), values.dtype().unwrap_or(DataType::Float)))
                .collect(),
            aliases: self.aliases,
            analysis: Vec::new(),
        };

        debug!("Built memory backend {} with {} rows in {} entries over {} files", self.name, rows, locations.len(), file_count);
        Ok(MemoryBackend {
            name: self.name,
            declarations,
            metadata: self.metadata,
            files,
            locations,
            reassignments,
            reads: AtomicUsize::new(0),
        })
    }

    fn validate(&self) -> ArborResult<usize> {
        for required in ["uid", "desc_uid"] {
            if !self.columns.iter().any(|(name, _, _)| name == required) {
                return Err(BackendError::MissingField { field: required.to_string() }.into());
            }
        }
        let rows = self.columns.first().map_or(0, |(_, values, _)| values.len());
        for (name, values, _) in &self.columns {
            if values.len() != rows {
                return Err(BackendError::ColumnLength {
                    field: name.clone(),
                    expected: rows,
                    found: values.len(),
                }
                .into());
            }
        }
        Ok(rows)
    }

    fn integer_column(&self, field: &str) -> ArborResult<Vec<i64>> {
        self.columns
            .iter()
            .find(|(name, _, _)| name == field)
            .and_then(|(_, values, _)| values.to_i64_vec())
            .ok_or_else(|| BackendError::MissingField { field: field.to_string() }.into())
    }

    fn apply_policy(&self, uids: &[Uid], desc_uids: &mut [Uid], index: &HashMap<Uid, usize>) -> ArborResult<Vec<Reassignment>> {
        let fallback = match &self.policy {
            MissingDescendantPolicy::Fallback { field } => Some((field.clone(), self.integer_column(field)?)),
            _ => None,
        };

        let mut reassignments = Vec::new();
        for row in 0..uids.len() {
            let desc = desc_uids[row];
            if desc == NO_DESCENDANT || index.contains_key(&desc) {
                continue;
            }
            let (new_desc, reason) = match (&self.policy, &fallback) {
                (MissingDescendantPolicy::Fallback { .. }, Some((field, values))) if index.contains_key(&values[row]) => {
                    (values[row], format!("descendant {desc} not found, using {field}"))
                }
                (MissingDescendantPolicy::PromoteToRoot, _) => (NO_DESCENDANT, format!("descendant {desc} not found, promoted to root")),
                _ => continue,
            };
            desc_uids[row] = new_desc;
            reassignments.push(Reassignment {
                uid: uids[row],
                old_desc_uid: desc,
                new_desc_uid: new_desc,
                reason,
            });
        }
        Ok(reassignments)
    }

    /// Rows of every entry in depth-first order, entries ordered by the first row of their root.
    fn group_rows(&self, uids: &[Uid], desc_uids: &[Uid], index: &HashMap<Uid, usize>) -> ArborResult<Vec<Vec<usize>>> {
        let count = uids.len();
        let parent: Vec<Option<usize>> = desc_uids.iter().map(|desc| index.get(desc).copied()).collect();

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (row, parent) in parent.iter().enumerate() {
            if let Some(p) = parent {
                children[*p].push(row);
            }
        }

        // A row without a resolvable parent starts a tree. Dangling links are kept
        // so the graph model can report them.
        let mut root_of: Vec<Option<usize>> = vec![None; count];
        for start in 0..count {
            let mut path = Vec::new();
            let mut current = start;
            let root = loop {
                if let Some(root) = root_of[current] {
                    break root;
                }
                if path.len() > count {
                    return Err(GraphError::DescendantCycle { uid: uids[start] }.into());
                }
                path.push(current);
                match parent[current] {
                    Some(p) => current = p,
                    None => break current,
                }
            };
            for row in path {
                root_of[row] = Some(root);
            }
        }

        let roots: Vec<usize> = (0..count).filter(|row| parent[*row].is_none()).collect();
        let forest_ids = match (&self.forest_field, self.access) {
            (Some(field), AccessMode::Forest) => Some(self.integer_column(field)?),
            _ => None,
        };

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_of_forest: HashMap<i64, usize> = HashMap::new();
        for root in roots {
            let mut rows = Vec::new();
            let mut stack = vec![root];
            while let Some(row) = stack.pop() {
                rows.push(row);
                stack.extend(children[row].iter().rev());
            }

            match &forest_ids {
                Some(ids) => {
                    let slot = *group_of_forest.entry(ids[root]).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[slot].extend(rows);
                }
                None => groups.push(rows),
            }
        }

        let assigned: usize = groups.iter().map(Vec::len).sum();
        if assigned != count {
            let stray = (0..count).find(|row| root_of[*row].is_none()).unwrap_or(0);
            return Err(GraphError::DescendantCycle { uid: uids[stray] }.into());
        }
        Ok(groups)
    }
}

/// Backend over in-memory columns
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    declarations: FieldDeclarations,
    metadata: ArborMetadata,
    files: Vec<BTreeMap<String, FieldValues>>,
    locations: Vec<ForestLocation>,
    reassignments: Vec<Reassignment>,
    reads: AtomicUsize,
}

impl MemoryBackend {
    pub fn builder(name: impl Into<String>) -> MemoryBackendBuilder {
        MemoryBackendBuilder {
            name: name.into(),
            columns: Vec::new(),
            aliases: Vec::new(),
            forest_field: None,
            access: AccessMode::Tree,
            policy: MissingDescendantPolicy::Reject,
            files: 1,
            metadata: ArborMetadata::default(),
        }
    }

    /// Number of `read_fields` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl DataBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> &'static str {
        "memory"
    }

    fn field_declarations(&self) -> FieldDeclarations {
        self.declarations.clone()
    }

    fn metadata(&self) -> ArborMetadata {
        self.metadata.clone()
    }

    fn plant(&self) -> ArborResult<PlantedForests> {
        for reassignment in &self.reassignments {
            warn!(
                "Halo {} descendant reassigned from {} to {}: {}",
                reassignment.uid, reassignment.old_desc_uid, reassignment.new_desc_uid, reassignment.reason
            );
        }
        Ok(PlantedForests {
            locations: self.locations.clone(),
            reassignments: self.reassignments.clone(),
        })
    }

    fn read_fields(&self, file: usize, rows: &RowSelection, fields: &[String]) -> ArborResult<BTreeMap<String, FieldValues>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let columns = self.files.get(file).ok_or(BackendError::InvalidRows {
            file,
            start: 0,
            end: rows.bound(),
        })?;

        let mut result = BTreeMap::new();
        for field in fields {
            let column = columns.get(field).ok_or_else(|| BackendError::MissingField { field: field.clone() })?;
            let values = rows.apply(column).ok_or(BackendError::InvalidRows { file, start: 0, end: rows.bound() })?;
            result.insert(field.clone(), values);
        }
        Ok(result)
    }
}
