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

//! Per-instance state of one forest block
//!
//! A `Forest` is created whenever a root is indexed from the arbor and is
//! shared by every node reached from that root. It owns the link index and
//! the field cache, both dropped with the last node holding it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::arbor::Arbor;
use super::links::ForestLinks;
use crate::backend::ForestLocation;
use crate::error::{ArborResult, FieldError};
use crate::fields::{FieldArray, FieldCache, FieldValue, FieldValues, RowSource};

pub struct Forest {
    entry: usize,
    location: ForestLocation,
    links: Mutex<Option<Arc<ForestLinks>>>,
    fields: Mutex<FieldCache>,
    tree_sizes: Mutex<HashMap<usize, usize>>,
}

impl Forest {
    pub(crate) fn new(entry: usize, location: ForestLocation) -> Self {
        Self {
            entry,
            location,
            links: Mutex::new(None),
            fields: Mutex::new(FieldCache::new()),
            tree_sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Index of the arbor entry this block belongs to.
    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn location(&self) -> &ForestLocation {
        &self.location
    }

    pub fn len(&self) -> usize {
        self.location.len()
    }

    pub fn is_empty(&self) -> bool {
        self.location.is_empty()
    }

    /// Link index, built on first use from the uid columns.
    pub(crate) fn links(&self, arbor: &Arbor) -> ArborResult<Arc<ForestLinks>> {
        let mut links = self.links.lock();
        if let Some(existing) = links.as_ref() {
            return Ok(existing.clone());
        }

        let fields = ["uid".to_string(), "desc_uid".to_string()];
        let (uids, desc_uids) = {
            let mut cache = self.fields.lock();
            arbor.resolve(RowSource::Forest(&self.location), &mut cache, &fields)?;
            (integer_column(&cache, "uid")?, integer_column(&cache, "desc_uid")?)
        };
        let built = Arc::new(ForestLinks::build(self.entry, uids, desc_uids)?);
        trace!("Linked forest {} with {} nodes", self.entry, built.len());
        *links = Some(built.clone());
        Ok(built)
    }

    pub(crate) fn cached_links(&self) -> Option<Arc<ForestLinks>> {
        self.links.lock().clone()
    }

    /// Resolves `fields` for the whole block without returning them.
    pub(crate) fn resolve(&self, arbor: &Arbor, fields: &[String]) -> ArborResult<()> {
        let mut cache = self.fields.lock();
        arbor.resolve(RowSource::Forest(&self.location), &mut cache, fields)
    }

    /// Runs `f` on the resolved column of `field`.
    pub(crate) fn with_column<R>(&self, arbor: &Arbor, field: &str, f: impl FnOnce(&FieldArray) -> R) -> ArborResult<R> {
        let mut cache = self.fields.lock();
        arbor.resolve(RowSource::Forest(&self.location), &mut cache, &[field.to_string()])?;
        let column = cache.get(field).ok_or_else(|| FieldError::NotFound { field: field.to_string() })?;
        Ok(f(column))
    }

    pub(crate) fn set_value(&self, arbor: &Arbor, field: &str, row: usize, value: &FieldValue) -> ArborResult<()> {
        let mut cache = self.fields.lock();
        arbor.resolve(RowSource::Forest(&self.location), &mut cache, &[field.to_string()])?;
        let column = cache.get_mut(field).ok_or_else(|| FieldError::NotFound { field: field.to_string() })?;
        if !column.values.set(row, value) {
            return Err(FieldError::InvalidValue {
                field: field.to_string(),
                value: value.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Writes `values` into `rows` of the cached column of `field`.
    pub(crate) fn set_rows(&self, arbor: &Arbor, field: &str, rows: &[usize], values: &FieldValues) -> ArborResult<()> {
        let mut cache = self.fields.lock();
        arbor.resolve(RowSource::Forest(&self.location), &mut cache, &[field.to_string()])?;
        let column = cache.get_mut(field).ok_or_else(|| FieldError::NotFound { field: field.to_string() })?;
        if values.len() != rows.len() {
            return Err(FieldError::LengthMismatch {
                field: field.to_string(),
                expected: rows.len(),
                found: values.len(),
            }
            .into());
        }
        for (position, row) in rows.iter().enumerate() {
            if let Some(value) = values.value_at(position)
                && !column.values.set(*row, &value)
            {
                return Err(FieldError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// `rows` of `field` if the column is already cached. Nothing is resolved.
    pub(crate) fn cached_rows(&self, field: &str, rows: &[usize]) -> ArborResult<Option<FieldValues>> {
        let cache = self.fields.lock();
        match cache.get(field) {
            Some(column) => Ok(Some(column.values.select_rows(field, rows)?)),
            None => Ok(None),
        }
    }

    /// Drops cached columns so they are recomputed on next access.
    pub(crate) fn invalidate(&self, fields: &[String]) {
        let mut cache = self.fields.lock();
        for field in fields {
            cache.remove(field);
        }
    }

    pub(crate) fn tree_size(&self, row: usize) -> Option<usize> {
        self.tree_sizes.lock().get(&row).copied()
    }

    pub(crate) fn store_tree_size(&self, row: usize, size: usize) {
        self.tree_sizes.lock().insert(row, size);
    }
}

fn integer_column(cache: &FieldCache, field: &str) -> ArborResult<Vec<i64>> {
    cache
        .get(field)
        .and_then(|column| column.values.to_i64_vec())
        .ok_or_else(|| FieldError::NotScalar { field: field.to_string() }.into())
}
