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

//! Vector fields
//!
//! Component fields named `<stem>x`, `<stem>_y`, `<stem>-Z<suffix>` and so on
//! are grouped into a vector field `<stem><suffix>` once all three components
//! exist. Each vector field also gets a `<name>_magnitude` companion.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use halotree_common::Units;
use regex::Regex;

use super::derived::FieldContext;
use super::registry::DerivedFunction;
use super::{FieldArray, FieldValues};
use crate::error::{ArborResult, FieldError};

/// Vector stems attempted on every arbor.
pub const STOCK_VECTOR_FIELDS: [&str; 3] = ["position", "velocity", "angular_momentum"];

const AXES: [char; 3] = ['x', 'y', 'z'];

static COMPONENT_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^(.+)([xyzXYZ])(.*)$").ok());

/// Groups field names into complete x/y/z component sets keyed by vector name.
pub fn detect_vector_fields(names: &[String]) -> BTreeMap<String, Vec<String>> {
    let Some(pattern) = COMPONENT_PATTERN.as_ref() else {
        return BTreeMap::new();
    };

    let mut candidates: BTreeMap<String, BTreeMap<char, String>> = BTreeMap::new();
    for name in names {
        let Some(captures) = pattern.captures(name) else {
            continue;
        };
        let prefix = captures[1].trim_end_matches(['-', '_']);
        if prefix.is_empty() {
            continue;
        }
        let axis = captures[2].chars().next().map(|c| c.to_ascii_lowercase());
        let vector = format!("{}{}", prefix, &captures[3]);
        if let Some(axis) = axis {
            candidates.entry(vector).or_default().entry(axis).or_insert_with(|| name.clone());
        }
    }

    candidates
        .into_iter()
        .filter(|(vector, components)| components.len() == AXES.len() && !names.contains(vector))
        .map(|(vector, components)| (vector, AXES.iter().filter_map(|axis| components.get(axis).cloned()).collect()))
        .collect()
}

/// Stacks `components` into one vector column.
pub(crate) fn vector_function(name: &str, components: Vec<String>) -> DerivedFunction {
    let name = name.to_string();
    Arc::new(move |ctx: &FieldContext<'_>| {
        let dim = components.len();
        let mut columns = Vec::with_capacity(dim);
        let mut units: Option<Units> = None;
        for component in &components {
            let array = ctx.get(component)?;
            let target = units.get_or_insert_with(|| array.units.clone()).clone();
            let array = array.to_units(&target).map_err(|_| FieldError::ConflictingComponentUnits {
                field: name.clone(),
                component: component.clone(),
                units: array.units.expr().to_string(),
                expected: target.expr().to_string(),
            })?;
            let values = array.as_f64_vec().ok_or_else(|| FieldError::NotScalar { field: component.clone() })?;
            columns.push(values);
        }

        let rows = columns.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows * dim);
        for row in 0..rows {
            data.extend(columns.iter().map(|column| column[row]));
        }
        Ok(FieldArray::new(FieldValues::Vector { dim, data }, units.unwrap_or_default()))
    })
}

/// Quadrature sum of the rows of vector field `vector`.
pub(crate) fn magnitude_function(vector: &str) -> DerivedFunction {
    let vector = vector.to_string();
    Arc::new(move |ctx: &FieldContext<'_>| {
        let array = ctx.get(&vector)?;
        magnitude(array)
    })
}

/// Per-row magnitude of a vector array.
pub fn magnitude(array: &FieldArray) -> ArborResult<FieldArray> {
    let FieldValues::Vector { dim, data } = &array.values else {
        return Ok(array.map(array.units.clone(), f64::abs));
    };
    let values = if *dim == 0 { Vec::new() } else { data.chunks(*dim).map(|row| row.iter().map(|v| v * v).sum::<f64>().sqrt()).collect() };
    Ok(FieldArray::new(FieldValues::Float(values), array.units.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_detects_separator_and_case_variants() {
        let found = detect_vector_fields(&names(&["velocity_x", "velocity-Y", "velocity_z", "Jx", "Jy", "Jz", "mass"]));
        assert_eq!(found.get("velocity").unwrap(), &names(&["velocity_x", "velocity-Y", "velocity_z"]));
        assert_eq!(found.get("J").unwrap(), &names(&["Jx", "Jy", "Jz"]));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_preserves_suffix() {
        let found = detect_vector_fields(&names(&["mean_x_gas", "mean_y_gas", "mean_z_gas", "mean_x_star"]));
        assert!(found.contains_key("mean_gas"));
        assert!(!found.contains_key("mean_star"));
    }

    #[test]
    fn test_incomplete_sets_are_ignored() {
        let found = detect_vector_fields(&names(&["spin_x", "spin_y"]));
        assert!(found.is_empty());
    }

    #[test]
    fn test_magnitude() {
        let vectors = FieldArray::dimensionless(FieldValues::Vector {
            dim: 3,
            data: vec![3.0, 4.0, 0.0, 1.0, 2.0, 2.0],
        });
        let result = magnitude(&vectors).unwrap();
        assert_eq!(result.values, FieldValues::Float(vec![5.0, 3.0]));
    }
}
