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

//! Progenitor selectors
//!
//! A selector picks one member of an ancestor set; walking the picks from a
//! node down to a leaf gives the progenitor line. Selectors are looked up by
//! name in a process-wide registry so that configuration files and the CLI
//! can name them.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use crate::error::{ArborResult, GraphError};
use crate::graph::Node;

/// Chooses one node out of an ancestor set
pub trait Selector: Send + Sync {
    fn name(&self) -> &str;

    /// Index of the chosen member of `ancestors`, which is never empty.
    fn select(&self, ancestors: &[Node]) -> ArborResult<usize>;
}

/// Builds a selector for a field name
pub type SelectorFactory = Arc<dyn Fn(&str) -> Arc<dyn Selector> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extreme {
    Max,
    Min,
}

/// Index of the extreme scalar value. Ties keep the earliest member, NaN never wins.
fn extreme_index(ancestors: &[Node], field: &str, extreme: Extreme) -> ArborResult<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, node) in ancestors.iter().enumerate() {
        let value = node.get_f64(field)?;
        if value.is_nan() {
            continue;
        }
        let better = match (best, extreme) {
            (None, _) => true,
            (Some((_, current)), Extreme::Max) => value > current,
            (Some((_, current)), Extreme::Min) => value < current,
        };
        if better {
            best = Some((index, value));
        }
    }
    Ok(best.map_or(0, |(index, _)| index))
}

/// Picks the ancestor with the largest value of a field
#[derive(Debug, Clone)]
pub struct MaxFieldValue {
    field: String,
}

impl MaxFieldValue {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Selector for MaxFieldValue {
    fn name(&self) -> &str {
        "max_field_value"
    }

    fn select(&self, ancestors: &[Node]) -> ArborResult<usize> {
        extreme_index(ancestors, &self.field, Extreme::Max)
    }
}

/// Picks the ancestor with the smallest value of a field
#[derive(Debug, Clone)]
pub struct MinFieldValue {
    field: String,
}

impl MinFieldValue {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Selector for MinFieldValue {
    fn name(&self) -> &str {
        "min_field_value"
    }

    fn select(&self, ancestors: &[Node]) -> ArborResult<usize> {
        extreme_index(ancestors, &self.field, Extreme::Min)
    }
}

/// Named selector factories
pub struct SelectorRegistry {
    factories: RwLock<BTreeMap<String, SelectorFactory>>,
}

static GLOBAL_SELECTORS: LazyLock<SelectorRegistry> = LazyLock::new(SelectorRegistry::with_builtins);

impl SelectorRegistry {
    fn with_builtins() -> Self {
        let mut factories: BTreeMap<String, SelectorFactory> = BTreeMap::new();
        factories.insert("max_field_value".to_string(), Arc::new(|field: &str| Arc::new(MaxFieldValue::new(field)) as Arc<dyn Selector>));
        factories.insert("min_field_value".to_string(), Arc::new(|field: &str| Arc::new(MinFieldValue::new(field)) as Arc<dyn Selector>));
        Self {
            factories: RwLock::new(factories),
        }
    }

    pub fn global() -> &'static SelectorRegistry {
        &GLOBAL_SELECTORS
    }

    pub fn register(&self, name: &str, factory: SelectorFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str, field: &str) -> ArborResult<Arc<dyn Selector>> {
        let factory = self.factories.read().get(name).cloned().ok_or_else(|| GraphError::UnknownSelector(name.to_string()))?;
        Ok(factory(field))
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

/// Makes a selector available to `Arbor::set_selector` under `name`.
pub fn register_selector(name: &str, factory: impl Fn(&str) -> Arc<dyn Selector> + Send + Sync + 'static) {
    SelectorRegistry::global().register(name, Arc::new(factory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::fields::FieldValues;
    use crate::graph::Arbor;

    fn create_test_ancestors(masses: Vec<f64>) -> Vec<Node> {
        let count = masses.len() as i64;
        let uids: Vec<i64> = (0..=count).collect();
        let mut desc_uids = vec![-1];
        desc_uids.extend(std::iter::repeat_n(0, masses.len()));
        let mut all_masses = vec![100.0];
        all_masses.extend(masses);

        let backend = MemoryBackend::builder("selector")
            .column("uid", FieldValues::Int(uids), "")
            .column("desc_uid", FieldValues::Int(desc_uids), "")
            .column("mass", FieldValues::Float(all_masses), "Msun")
            .build()
            .unwrap();
        Arbor::new(backend).unwrap().root(0).unwrap().ancestors().unwrap()
    }

    #[test]
    fn test_max_and_min() {
        let ancestors = create_test_ancestors(vec![3.0, 9.0, 1.0, 9.0]);
        assert_eq!(MaxFieldValue::new("mass").select(&ancestors).unwrap(), 1);
        assert_eq!(MinFieldValue::new("mass").select(&ancestors).unwrap(), 2);
    }

    #[test]
    fn test_nan_is_skipped() {
        let ancestors = create_test_ancestors(vec![f64::NAN, 2.0, 5.0]);
        assert_eq!(MaxFieldValue::new("mass").select(&ancestors).unwrap(), 2);
        assert_eq!(MinFieldValue::new("mass").select(&ancestors).unwrap(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        struct Last;
        impl Selector for Last {
            fn name(&self) -> &str {
                "last"
            }
            fn select(&self, ancestors: &[Node]) -> ArborResult<usize> {
                Ok(ancestors.len() - 1)
            }
        }

        register_selector("last", |_field: &str| Arc::new(Last) as Arc<dyn Selector>);
        let ancestors = create_test_ancestors(vec![3.0, 9.0, 1.0]);
        let selector = SelectorRegistry::global().create("last", "mass").unwrap();
        assert_eq!(selector.select(&ancestors).unwrap(), 2);
        assert!(SelectorRegistry::global().names().contains(&"max_field_value".to_string()));
        assert!(SelectorRegistry::global().create("nope", "mass").is_err());
    }
}
