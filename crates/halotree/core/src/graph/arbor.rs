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

//! The loaded dataset
//!
//! An [`Arbor`] binds a backend to a field registry and a selector. Nothing is
//! read at construction: the first size or index access plants the forests
//! (locates every entry's block) and caches the result.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use halotree_common::{HaloTreeConfig, UnitSystem};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use super::forest::Forest;
use super::node::Node;
use crate::backend::{ArborMetadata, DataBackend, ForestLocation, PlantedForests, Reassignment};
use crate::error::{ArborResult, FieldError, GraphError};
use crate::fields::{DataType, DerivedFunction, FieldArray, FieldCache, FieldDefinition, FieldRegistry, FieldValue, Resolver, RowSource};
use crate::traversal::{RootNodes, Selector, SelectorRegistry};

pub struct Arbor {
    name: String,
    backend: Arc<dyn DataBackend>,
    registry: RwLock<FieldRegistry>,
    selector: RwLock<Arc<dyn Selector>>,
    metadata: ArborMetadata,
    config: HaloTreeConfig,
    planted: Mutex<Option<Arc<PlantedForests>>>,
    tree_sizes: Mutex<HashMap<usize, usize>>,
    root_fields: Mutex<FieldCache>,
}

impl Arbor {
    /// Wraps a backend with the default configuration.
    pub fn new(backend: impl DataBackend + 'static) -> ArborResult<Arc<Self>> {
        Self::with_config(Arc::new(backend), HaloTreeConfig::default())
    }

    pub fn with_config(backend: Arc<dyn DataBackend>, config: HaloTreeConfig) -> ArborResult<Arc<Self>> {
        let metadata = backend.metadata();
        let units = UnitSystem::new(metadata.hubble_constant);
        let registry = FieldRegistry::from_declarations(&backend.field_declarations(), units)?;
        let selector = SelectorRegistry::global().create(&config.default_selector, &config.selector_field)?;
        debug!("Created arbor {} ({} backend) with {} fields", backend.name(), backend.format(), registry.names().len());

        Ok(Arc::new(Self {
            name: backend.name().to_string(),
            backend,
            registry: RwLock::new(registry),
            selector: RwLock::new(selector),
            metadata,
            config,
            planted: Mutex::new(None),
            tree_sizes: Mutex::new(HashMap::new()),
            root_fields: Mutex::new(FieldCache::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn DataBackend> {
        &self.backend
    }

    pub fn metadata(&self) -> &ArborMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &HaloTreeConfig {
        &self.config
    }

    pub fn hubble_constant(&self) -> Option<f64> {
        self.metadata.hubble_constant
    }

    pub fn unit_system(&self) -> UnitSystem {
        self.registry.read().unit_system()
    }

    /// True when the arbor was loaded from the canonical container.
    pub fn is_canonical(&self) -> bool {
        self.backend.is_canonical()
    }

    /// Read access to the field registry.
    pub fn registry(&self) -> RwLockReadGuard<'_, FieldRegistry> {
        self.registry.read()
    }

    pub(crate) fn planted(&self) -> ArborResult<Arc<PlantedForests>> {
        let mut planted = self.planted.lock();
        if let Some(existing) = planted.as_ref() {
            return Ok(existing.clone());
        }
        let forests = Arc::new(self.backend.plant()?);
        let nodes: usize = forests.locations.iter().map(ForestLocation::len).sum();
        info!("Planted {} trees ({} nodes) from {}", forests.locations.len(), nodes, self.name);
        if !forests.reassignments.is_empty() {
            warn!("{} descendant links were reassigned while planting {}", forests.reassignments.len(), self.name);
        }
        *planted = Some(forests.clone());
        Ok(forests)
    }

    /// Number of entries. The first call plants the forests.
    pub fn size(&self) -> ArborResult<usize> {
        Ok(self.planted()?.locations.len())
    }

    /// Descendant links the backend rewrote while planting.
    pub fn reassignments(&self) -> ArborResult<Vec<Reassignment>> {
        Ok(self.planted()?.reassignments.clone())
    }

    pub(crate) fn location(&self, index: usize) -> ArborResult<ForestLocation> {
        let planted = self.planted()?;
        planted.locations.get(index).copied().ok_or_else(|| {
            GraphError::EntryOutOfRange {
                index,
                size: planted.locations.len(),
            }
            .into()
        })
    }

    /// Root node of entry `index`. Every call returns a fresh instance.
    pub fn root(self: &Arc<Self>, index: usize) -> ArborResult<Node> {
        let location = self.location(index)?;
        let forest = Arc::new(Forest::new(index, location));
        Ok(Node::new(self.clone(), forest, 0, location.root_uid))
    }

    pub fn roots(self: &Arc<Self>, range: Range<usize>) -> ArborResult<Vec<Node>> {
        range.map(|index| self.root(index)).collect()
    }

    /// Lazily constructed root nodes in entry order.
    pub fn iter(self: &Arc<Self>) -> ArborResult<RootNodes> {
        Ok(RootNodes::new(self.clone(), self.size()?))
    }

    pub(crate) fn resolve(&self, source: RowSource<'_>, cache: &mut FieldCache, fields: &[String]) -> ArborResult<()> {
        let registry = self.registry.read();
        Resolver::new(&registry, self.backend.as_ref(), &self.metadata).resolve(source, cache, fields)
    }

    /// Values of `field` for every root, in entry order.
    pub fn field(&self, field: &str) -> ArborResult<FieldArray> {
        let planted = self.planted()?;
        let mut cache = self.root_fields.lock();
        self.resolve(RowSource::Roots(&planted.locations), &mut cache, &[field.to_string()])?;
        cache.get(field).cloned().ok_or_else(|| FieldError::NotFound { field: field.to_string() }.into())
    }

    /// Keeps the root field cache in step with a value set on a root node.
    pub(crate) fn set_root_value(&self, entry: usize, field: &str, value: &FieldValue) -> ArborResult<()> {
        let planted = self.planted()?;
        let mut cache = self.root_fields.lock();
        self.resolve(RowSource::Roots(&planted.locations), &mut cache, &[field.to_string()])?;
        if let Some(column) = cache.get_mut(field) {
            column.values.set(entry, value);
        }
        Ok(())
    }

    pub(crate) fn invalidate_root_fields(&self, fields: &[String]) {
        let mut cache = self.root_fields.lock();
        for field in fields {
            cache.remove(field);
        }
    }

    pub(crate) fn cached_tree_size(&self, entry: usize) -> Option<usize> {
        self.tree_sizes.lock().get(&entry).copied()
    }

    pub(crate) fn store_tree_size(&self, entry: usize, size: usize) {
        self.tree_sizes.lock().insert(entry, size);
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.registry.read().contains(field)
    }

    pub fn field_info(&self, field: &str) -> Option<FieldDefinition> {
        self.registry.read().get(field).cloned()
    }

    /// Fields stored by the backend.
    pub fn field_list(&self) -> Vec<String> {
        self.registry.read().field_list()
    }

    pub fn derived_field_list(&self) -> Vec<String> {
        self.registry.read().derived_field_list()
    }

    pub fn analysis_field_list(&self) -> Vec<String> {
        self.registry.read().analysis_field_list()
    }

    pub fn vector_field_list(&self) -> Vec<String> {
        self.registry.read().vector_field_list()
    }

    /// Adds an alias, overriding an existing alias of the same name.
    pub fn add_alias_field(&self, alias: &str, target: &str, units: Option<&str>) -> ArborResult<()> {
        self.registry.write().add_alias(alias, target, units, true)?;
        self.invalidate_root_fields(&[alias.to_string()]);
        Ok(())
    }

    /// Adds a derived field, overriding any existing definition of `name`.
    pub fn add_derived_field(&self, name: &str, dependencies: &[&str], function: DerivedFunction, units: Option<&str>, description: Option<&str>) -> ArborResult<()> {
        let dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self.registry.write().add_derived(name, dependencies, function, units, description, true)?;
        self.invalidate_root_fields(&[name.to_string()]);
        Ok(())
    }

    pub fn add_analysis_field(&self, name: &str, units: &str, default: f64, dtype: DataType) -> ArborResult<()> {
        self.registry.write().add_analysis(name, units, default, dtype, None)
    }

    pub fn add_vector_field(&self, name: &str, components: &[&str]) -> ArborResult<()> {
        let components: Vec<String> = components.iter().map(|c| c.to_string()).collect();
        self.registry.write().add_vector_field(name, &components)
    }

    /// Installs a selector from the global registry.
    pub fn set_selector(&self, name: &str, field: &str) -> ArborResult<()> {
        let selector = SelectorRegistry::global().create(name, field)?;
        self.set_selector_impl(selector);
        Ok(())
    }

    pub fn set_selector_impl(&self, selector: Arc<dyn Selector>) {
        debug!("Using selector {} for {}", selector.name(), self.name);
        *self.selector.write() = selector;
    }

    pub fn selector(&self) -> Arc<dyn Selector> {
        self.selector.read().clone()
    }
}

impl fmt::Debug for Arbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbor").field("name", &self.name).field("format", &self.backend.format()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::fields::{FieldContext, FieldValues};

    fn create_test_arbor() -> Arc<Arbor> {
        let backend = MemoryBackend::builder("arbor")
            .column("uid", FieldValues::Int(vec![1, 2, 3, 10, 11]), "")
            .column("desc_uid", FieldValues::Int(vec![-1, 1, 1, -1, 10]), "")
            .column("mass", FieldValues::Float(vec![10.0, 4.0, 6.0, 3.0, 2.0]), "Msun")
            .build()
            .unwrap();
        Arbor::new(backend).unwrap()
    }

    #[test]
    fn test_size_and_roots() {
        let arbor = create_test_arbor();
        assert_eq!(arbor.size().unwrap(), 2);
        assert_eq!(arbor.root(1).unwrap().uid(), 10);
        assert!(matches!(arbor.root(2), Err(crate::ArborError::Graph(GraphError::EntryOutOfRange { index: 2, size: 2 }))));
        assert_eq!(arbor.roots(0..2).unwrap().len(), 2);
    }

    #[test]
    fn test_root_field() {
        let arbor = create_test_arbor();
        assert_eq!(arbor.field("mass").unwrap().as_f64_vec().unwrap(), vec![10.0, 3.0]);
    }

    #[test]
    fn test_derived_field_override_invalidates_root_cache() {
        let arbor = create_test_arbor();
        let double: DerivedFunction = Arc::new(|ctx: &FieldContext<'_>| Ok(ctx.get("mass")?.scale(2.0)));
        arbor.add_derived_field("heavy", &["mass"], double, Some("Msun"), None).unwrap();
        assert_eq!(arbor.field("heavy").unwrap().as_f64_vec().unwrap(), vec![20.0, 6.0]);

        let triple: DerivedFunction = Arc::new(|ctx: &FieldContext<'_>| Ok(ctx.get("mass")?.scale(3.0)));
        arbor.add_derived_field("heavy", &["mass"], triple, Some("Msun"), None).unwrap();
        assert_eq!(arbor.field("heavy").unwrap().as_f64_vec().unwrap(), vec![30.0, 9.0]);
    }

    #[test]
    fn test_unknown_selector() {
        let arbor = create_test_arbor();
        assert!(arbor.set_selector("median_field_value", "mass").is_err());
        arbor.set_selector("min_field_value", "mass").unwrap();
        assert_eq!(arbor.selector().name(), "min_field_value");
    }
}
