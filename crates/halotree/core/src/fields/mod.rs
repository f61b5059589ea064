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

//! Field values and the field resolution engine
//!
//! Field data is columnar: a [`FieldArray`] holds one value per node of a
//! forest (or per root of an arbor) together with its [`Units`]. The
//! [`registry`] records how each field name is produced and the [`resolver`]
//! computes requested fields from native columns, aliases, derived functions
//! and analysis defaults.

pub mod derived;
pub mod registry;
pub mod resolver;
pub mod vector;

pub use derived::*;
pub use registry::*;
pub use resolver::*;
pub use vector::*;

use std::fmt;

use halotree_common::{UnitResult, Units};
use serde::{Deserialize, Serialize};

use crate::error::FieldError;

/// Storage type of a scalar field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Int,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float => write!(f, "FLOAT"),
            DataType::Int => write!(f, "INT"),
        }
    }
}

/// Column of values, one entry (or one vector) per row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValues {
    Float(Vec<f64>),
    Int(Vec<i64>),
    /// Row-major vectors of `dim` components each.
    Vector { dim: usize, data: Vec<f64> },
}

impl FieldValues {
    /// Column of `len` copies of `value`.
    pub fn filled(dtype: DataType, len: usize, value: f64) -> Self {
        match dtype {
            DataType::Float => FieldValues::Float(vec![value; len]),
            DataType::Int => FieldValues::Int(vec![value as i64; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FieldValues::Float(values) => values.len(),
            FieldValues::Int(values) => values.len(),
            FieldValues::Vector { dim, data } => if *dim == 0 { 0 } else { data.len() / dim },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Option<DataType> {
        match self {
            FieldValues::Float(_) => Some(DataType::Float),
            FieldValues::Int(_) => Some(DataType::Int),
            FieldValues::Vector { .. } => None,
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, FieldValues::Vector { .. })
    }

    /// Value at `row`, or `None` past the end.
    pub fn value_at(&self, row: usize) -> Option<FieldValue> {
        match self {
            FieldValues::Float(values) => values.get(row).map(|v| FieldValue::Float(*v)),
            FieldValues::Int(values) => values.get(row).map(|v| FieldValue::Int(*v)),
            FieldValues::Vector { dim, data } => data.get(row * dim..(row + 1) * dim).map(|v| FieldValue::Vector(v.to_vec())),
        }
    }

    /// Scalar view as floats; `None` for vectors.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            FieldValues::Float(values) => Some(values.clone()),
            FieldValues::Int(values) => Some(values.iter().map(|v| *v as f64).collect()),
            FieldValues::Vector { .. } => None,
        }
    }

    /// Integer view, used for uid columns. Floats are truncated.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            FieldValues::Float(values) => Some(values.iter().map(|v| *v as i64).collect()),
            FieldValues::Int(values) => Some(values.clone()),
            FieldValues::Vector { .. } => None,
        }
    }

    /// Rows picked by index, in the given order. `None` if a row is past the end.
    pub fn select(&self, rows: &[usize]) -> Option<FieldValues> {
        if rows.iter().any(|&row| row >= self.len()) {
            return None;
        }
        Some(match self {
            FieldValues::Float(values) => FieldValues::Float(rows.iter().map(|&r| values[r]).collect()),
            FieldValues::Int(values) => FieldValues::Int(rows.iter().map(|&r| values[r]).collect()),
            FieldValues::Vector { dim, data } => FieldValues::Vector {
                dim: *dim,
                data: rows.iter().flat_map(|&r| data[r * dim..(r + 1) * dim].iter().copied()).collect(),
            },
        })
    }

    /// [`FieldValues::select`] with a short column reported against `field`.
    pub fn select_rows(&self, field: &str, rows: &[usize]) -> Result<FieldValues, FieldError> {
        self.select(rows).ok_or_else(|| FieldError::LengthMismatch {
            field: field.to_string(),
            expected: rows.iter().max().map_or(0, |row| row + 1),
            found: self.len(),
        })
    }

    /// Contiguous row range, or `None` if it runs past the end.
    pub fn slice(&self, start: usize, end: usize) -> Option<FieldValues> {
        if start > end || end > self.len() {
            return None;
        }
        Some(match self {
            FieldValues::Float(values) => FieldValues::Float(values[start..end].to_vec()),
            FieldValues::Int(values) => FieldValues::Int(values[start..end].to_vec()),
            FieldValues::Vector { dim, data } => FieldValues::Vector {
                dim: *dim,
                data: data[start * dim..end * dim].to_vec(),
            },
        })
    }

    /// Appends the rows of `other`. Mismatched kinds are promoted to floats.
    pub fn extend(&mut self, other: &FieldValues) {
        if let (FieldValues::Int(values), FieldValues::Float(_)) = (&*self, other) {
            *self = FieldValues::Float(values.iter().map(|v| *v as f64).collect());
        }
        match (self, other) {
            (FieldValues::Float(values), FieldValues::Float(more)) => values.extend_from_slice(more),
            (FieldValues::Float(values), FieldValues::Int(more)) => values.extend(more.iter().map(|v| *v as f64)),
            (FieldValues::Int(values), FieldValues::Int(more)) => values.extend_from_slice(more),
            (FieldValues::Vector { data, .. }, FieldValues::Vector { data: more, .. }) => data.extend_from_slice(more),
            _ => {}
        }
    }

    /// Empty column of the same kind.
    pub fn empty_like(&self) -> FieldValues {
        match self {
            FieldValues::Float(_) => FieldValues::Float(Vec::new()),
            FieldValues::Int(_) => FieldValues::Int(Vec::new()),
            FieldValues::Vector { dim, .. } => FieldValues::Vector { dim: *dim, data: Vec::new() },
        }
    }

    /// Multiplies every value by `factor`, promoting integers to floats unless `factor` is one.
    pub fn scaled(&self, factor: f64) -> FieldValues {
        if factor == 1.0 {
            return self.clone();
        }
        match self {
            FieldValues::Float(values) => FieldValues::Float(values.iter().map(|v| v * factor).collect()),
            FieldValues::Int(values) => FieldValues::Float(values.iter().map(|v| *v as f64 * factor).collect()),
            FieldValues::Vector { dim, data } => FieldValues::Vector {
                dim: *dim,
                data: data.iter().map(|v| v * factor).collect(),
            },
        }
    }

    /// Overwrites `row`. Returns false if the value does not fit the column.
    pub fn set(&mut self, row: usize, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldValues::Float(values), FieldValue::Float(v)) if row < values.len() => values[row] = *v,
            (FieldValues::Float(values), FieldValue::Int(v)) if row < values.len() => values[row] = *v as f64,
            (FieldValues::Int(values), FieldValue::Int(v)) if row < values.len() => values[row] = *v,
            (FieldValues::Int(values), FieldValue::Float(v)) if row < values.len() && v.fract() == 0.0 => values[row] = *v as i64,
            (FieldValues::Vector { dim, data }, FieldValue::Vector(v)) if v.len() == *dim && (row + 1) * *dim <= data.len() => {
                data[row * *dim..(row + 1) * *dim].copy_from_slice(v)
            }
            _ => return false,
        }
        true
    }
}

/// Value of one field for one node
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Vector(Vec<f64>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Vector(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Float(v) => Some(*v as i64),
            FieldValue::Int(v) => Some(*v),
            FieldValue::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            FieldValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Vector(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(value: Vec<f64>) -> Self {
        FieldValue::Vector(value)
    }
}

/// A field value with units, as returned for a single node
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: FieldValue,
    pub units: Units,
}

impl Quantity {
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Scalar value converted into `units`.
    pub fn to_units(&self, units: &Units) -> UnitResult<Option<f64>> {
        let factor = self.units.conversion_factor(units)?;
        Ok(self.value.as_f64().map(|v| v * factor))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.units.is_dimensionless() { write!(f, "{}", self.value) } else { write!(f, "{} {}", self.value, self.units) }
    }
}

/// A column of field values with units
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArray {
    pub values: FieldValues,
    pub units: Units,
}

impl FieldArray {
    pub fn new(values: FieldValues, units: Units) -> Self {
        Self { values, units }
    }

    pub fn dimensionless(values: FieldValues) -> Self {
        Self::new(values, Units::dimensionless())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_at(&self, row: usize) -> Option<Quantity> {
        self.values.value_at(row).map(|value| Quantity {
            value,
            units: self.units.clone(),
        })
    }

    pub fn select(&self, field: &str, rows: &[usize]) -> Result<FieldArray, FieldError> {
        Ok(FieldArray::new(self.values.select_rows(field, rows)?, self.units.clone()))
    }

    /// Scalar values as floats; `None` for vector fields.
    pub fn as_f64_vec(&self) -> Option<Vec<f64>> {
        self.values.to_f64_vec()
    }

    /// Same values expressed in `units`.
    pub fn to_units(&self, units: &Units) -> UnitResult<FieldArray> {
        let factor = self.units.conversion_factor(units)?;
        Ok(FieldArray::new(self.values.scaled(factor), units.clone()))
    }

    pub fn mul(&self, other: &FieldArray) -> FieldArray {
        self.zip_with(other, self.units.multiply(&other.units), |a, b| a * b)
    }

    pub fn div(&self, other: &FieldArray) -> FieldArray {
        self.zip_with(other, self.units.divide(&other.units), |a, b| a / b)
    }

    /// Sum, with `other` converted into the units of `self`.
    pub fn add(&self, other: &FieldArray) -> UnitResult<FieldArray> {
        let other = other.to_units(&self.units)?;
        Ok(self.zip_with(&other, self.units.clone(), |a, b| a + b))
    }

    pub fn sub(&self, other: &FieldArray) -> UnitResult<FieldArray> {
        let other = other.to_units(&self.units)?;
        Ok(self.zip_with(&other, self.units.clone(), |a, b| a - b))
    }

    /// Multiplies by a dimensionless constant.
    pub fn scale(&self, factor: f64) -> FieldArray {
        self.map(self.units.clone(), |v| v * factor)
    }

    /// Applies `f` to every value, attaching `units` to the result.
    pub fn map(&self, units: Units, f: impl Fn(f64) -> f64) -> FieldArray {
        let values = match &self.values {
            FieldValues::Vector { dim, data } => FieldValues::Vector {
                dim: *dim,
                data: data.iter().map(|v| f(*v)).collect(),
            },
            scalar => FieldValues::Float(scalar.to_f64_vec().unwrap_or_default().into_iter().map(f).collect()),
        };
        FieldArray::new(values, units)
    }

    pub fn powi(&self, power: i32) -> FieldArray {
        self.map(self.units.powi(power), |v| v.powi(power))
    }

    pub fn sqrt(&self) -> UnitResult<FieldArray> {
        Ok(self.map(self.units.sqrt()?, f64::sqrt))
    }

    fn zip_with(&self, other: &FieldArray, units: Units, f: impl Fn(f64, f64) -> f64) -> FieldArray {
        let lhs = flatten(&self.values);
        let rhs = flatten(&other.values);
        let data: Vec<f64> = lhs.iter().zip(rhs.iter()).map(|(a, b)| f(*a, *b)).collect();
        let values = match (&self.values, &other.values) {
            (FieldValues::Vector { dim, .. }, _) | (_, FieldValues::Vector { dim, .. }) => FieldValues::Vector { dim: *dim, data },
            _ => FieldValues::Float(data),
        };
        FieldArray::new(values, units)
    }
}

fn flatten(values: &FieldValues) -> Vec<f64> {
    match values {
        FieldValues::Vector { data, .. } => data.clone(),
        scalar => scalar.to_f64_vec().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msun() -> Units {
        Units::parse("Msun").unwrap()
    }

    #[test]
    fn test_value_access() {
        let values = FieldValues::Vector {
            dim: 3,
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values.value_at(1), Some(FieldValue::Vector(vec![4.0, 5.0, 6.0])));
        assert_eq!(values.value_at(2), None);
        assert_eq!(
            values.select(&[1, 0]),
            Some(FieldValues::Vector {
                dim: 3,
                data: vec![4.0, 5.0, 6.0, 1.0, 2.0, 3.0]
            })
        );
    }

    #[test]
    fn test_short_columns_are_errors() {
        let values = FieldValues::Float(vec![1.0, 2.0]);
        assert_eq!(values.select(&[0, 2]), None);
        assert_eq!(values.slice(1, 3), None);
        assert_eq!(values.slice(1, 2), Some(FieldValues::Float(vec![2.0])));
        assert!(matches!(
            values.select_rows("mass", &[4]),
            Err(FieldError::LengthMismatch { expected: 5, found: 2, .. })
        ));
    }

    #[test]
    fn test_set_respects_column_kind() {
        let mut ints = FieldValues::Int(vec![0, 0]);
        assert!(ints.set(1, &FieldValue::Int(7)));
        assert!(!ints.set(0, &FieldValue::Float(0.5)));
        assert!(!ints.set(5, &FieldValue::Int(1)));
        assert_eq!(ints, FieldValues::Int(vec![0, 7]));
    }

    #[test]
    fn test_extend_promotes_mixed_kinds() {
        let mut values = FieldValues::Int(vec![1, 2]);
        values.extend(&FieldValues::Float(vec![2.5]));
        assert_eq!(values, FieldValues::Float(vec![1.0, 2.0, 2.5]));
    }

    #[test]
    fn test_arithmetic_units() {
        let mass = FieldArray::new(FieldValues::Float(vec![2.0, 4.0]), msun());
        let radius = FieldArray::new(FieldValues::Float(vec![1.0, 2.0]), Units::parse("kpc").unwrap());

        let density = mass.div(&radius.powi(3));
        assert_eq!(density.as_f64_vec().unwrap(), vec![2.0, 0.5]);
        assert!(density.units.is_equivalent(&Units::parse("Msun/kpc**3").unwrap()));

        let grams = FieldArray::new(FieldValues::Float(vec![halotree_common::MSUN_G, 0.0]), Units::parse("g").unwrap());
        let total = mass.add(&grams).unwrap().as_f64_vec().unwrap();
        assert!((total[0] - 3.0).abs() < 1e-12 && total[1] == 4.0);

        assert!(mass.add(&radius).is_err());
    }

    #[test]
    fn test_conversion() {
        let masses = FieldArray::new(FieldValues::Int(vec![1, 2]), Units::parse("kg").unwrap());
        let grams = masses.to_units(&Units::parse("g").unwrap()).unwrap();
        assert_eq!(grams.values, FieldValues::Float(vec![1000.0, 2000.0]));
    }
}
