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

//! Derived fields
//!
//! Derived field functions receive a [`FieldContext`] exposing the already
//! resolved dependency columns for the same set of nodes.

use std::sync::Arc;

use halotree_common::{UnitSystem, Units};

use super::registry::DerivedFunction;
use super::resolver::FieldCache;
use super::{FieldArray, FieldValues};
use crate::backend::ArborMetadata;
use crate::error::{ArborResult, FieldError};

/// Dependency access for a derived field function
pub struct FieldContext<'a> {
    field: &'a str,
    cache: &'a FieldCache,
    len: usize,
    metadata: &'a ArborMetadata,
    units: UnitSystem,
}

impl<'a> FieldContext<'a> {
    pub(crate) fn new(field: &'a str, cache: &'a FieldCache, len: usize, metadata: &'a ArborMetadata, units: UnitSystem) -> Self {
        Self {
            field,
            cache,
            len,
            metadata,
            units,
        }
    }

    /// Name of the field being computed.
    pub fn field(&self) -> &str {
        self.field
    }

    /// Resolved values of a declared dependency.
    pub fn get(&self, name: &str) -> ArborResult<&'a FieldArray> {
        self.cache.get(name).ok_or_else(|| {
            FieldError::DependencyNotFound {
                field: self.field.to_string(),
                dependency: name.to_string(),
            }
            .into()
        })
    }

    /// Number of nodes being resolved.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn metadata(&self) -> &ArborMetadata {
        self.metadata
    }

    /// Parses a unit expression with the arbor's hubble constant.
    pub fn units(&self, expr: &str) -> ArborResult<Units> {
        Ok(self.units.parse(expr)?)
    }

    /// Column of `len` copies of `value`.
    pub fn filled(&self, value: f64, units: Units) -> FieldArray {
        FieldArray::new(FieldValues::Float(vec![value; self.len]), units)
    }
}

/// A derived field provided for every arbor whose dependencies exist
pub(crate) struct StockDerivedField {
    pub name: &'static str,
    pub dependencies: Vec<String>,
    pub function: DerivedFunction,
    pub units: &'static str,
    pub description: &'static str,
}

pub(crate) fn stock_derived_fields() -> Vec<StockDerivedField> {
    vec![StockDerivedField {
        name: "redshift",
        dependencies: vec!["scale_factor".to_string()],
        function: Arc::new(redshift),
        units: "",
        description: "redshift computed from scale_factor",
    }]
}

/// `z = 1/a - 1`
fn redshift(ctx: &FieldContext<'_>) -> ArborResult<FieldArray> {
    let scale_factor = ctx.get("scale_factor")?;
    Ok(scale_factor.map(Units::dimensionless(), |a| 1.0 / a - 1.0))
}
