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

//! Field resolution
//!
//! Resolving a set of fields for a set of nodes walks the dependency graph of
//! the requested names, reads every stored column in one backend call per
//! backing file and then computes aliases, derived and analysis fields in
//! dependency order. Results land in a [`FieldCache`] keyed by field name.

use std::collections::{BTreeMap, HashMap};

use halotree_common::{UnitError, UnitSystem};
use tracing::trace;

use super::derived::FieldContext;
use super::registry::{FieldDefinition, FieldKind, FieldRegistry};
use super::{FieldArray, FieldValues};
use crate::backend::{ArborMetadata, DataBackend, ForestLocation, RowSelection};
use crate::error::{ArborError, ArborResult, BackendError, FieldError};

/// Resolved columns for one set of nodes.
pub type FieldCache = HashMap<String, FieldArray>;

/// The nodes a resolution covers
#[derive(Debug, Clone, Copy)]
pub enum RowSource<'a> {
    /// Every row of one forest block.
    Forest(&'a ForestLocation),
    /// The root row of each entry, in entry order.
    Roots(&'a [ForestLocation]),
}

impl RowSource<'_> {
    pub fn len(&self) -> usize {
        match self {
            RowSource::Forest(location) => location.len(),
            RowSource::Roots(locations) => locations.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads stored columns, one backend call per backing file.
    fn read(&self, backend: &dyn DataBackend, fields: &[String]) -> ArborResult<BTreeMap<String, FieldValues>> {
        match self {
            RowSource::Forest(location) => {
                let rows = RowSelection::Range {
                    start: location.start,
                    end: location.end,
                };
                backend.read_fields(location.file, &rows, fields)
            }
            RowSource::Roots(locations) => {
                if let Some(values) = backend.read_root_fields(fields)? {
                    return Ok(values);
                }
                read_roots_by_file(backend, locations, fields)
            }
        }
    }
}

/// Groups root rows by file, reads each file once and restores entry order.
fn read_roots_by_file(backend: &dyn DataBackend, locations: &[ForestLocation], fields: &[String]) -> ArborResult<BTreeMap<String, FieldValues>> {
    let mut by_file: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    for (entry, location) in locations.iter().enumerate() {
        by_file.entry(location.file).or_default().push((entry, location.start));
    }

    // Position of every entry within the concatenation of per-file results.
    let mut positions = vec![0; locations.len()];
    let mut combined: BTreeMap<String, FieldValues> = BTreeMap::new();
    let mut offset = 0;
    for (file, rows) in &by_file {
        for (i, (entry, _)) in rows.iter().enumerate() {
            positions[*entry] = offset + i;
        }
        offset += rows.len();

        let selection = RowSelection::Rows(rows.iter().map(|(_, row)| *row).collect());
        for (name, values) in backend.read_fields(*file, &selection, fields)? {
            match combined.get_mut(&name) {
                Some(existing) => existing.extend(&values),
                None => {
                    combined.insert(name, values);
                }
            }
        }
    }

    combined
        .into_iter()
        .map(|(name, values)| {
            let values = values.select_rows(&name, &positions)?;
            Ok((name, values))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Resolves fields against one registry and backend
pub struct Resolver<'a> {
    registry: &'a FieldRegistry,
    backend: &'a dyn DataBackend,
    metadata: &'a ArborMetadata,
    units: UnitSystem,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a FieldRegistry, backend: &'a dyn DataBackend, metadata: &'a ArborMetadata) -> Self {
        Self {
            registry,
            backend,
            metadata,
            units: registry.unit_system(),
        }
    }

    /// Ensures every name in `fields` is present in `cache`.
    pub fn resolve(&self, source: RowSource<'_>, cache: &mut FieldCache, fields: &[String]) -> ArborResult<()> {
        let plan = self.plan(cache, fields)?;
        if plan.is_empty() {
            return Ok(());
        }

        let stored: Vec<String> = plan.iter().filter(|d| d.is_stored()).map(|d| d.name.clone()).collect();
        let mut columns = if stored.is_empty() { BTreeMap::new() } else { source.read(self.backend, &stored)? };
        trace!("Resolving {} fields ({} stored) for {} nodes", plan.len(), stored.len(), source.len());

        let len = source.len();
        for definition in plan {
            let array = self.compute(&definition, &mut columns, cache, len)?;
            if array.len() != len {
                return Err(FieldError::LengthMismatch {
                    field: definition.name.clone(),
                    expected: len,
                    found: array.len(),
                }
                .into());
            }
            cache.insert(definition.name.clone(), array);
        }
        Ok(())
    }

    /// Definitions to compute, dependencies first. Cached names are skipped.
    fn plan(&self, cache: &FieldCache, fields: &[String]) -> ArborResult<Vec<FieldDefinition>> {
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut order = Vec::new();
        for field in fields {
            self.visit(field, None, cache, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit(&self, name: &str, requester: Option<&str>, cache: &FieldCache, marks: &mut HashMap<String, Mark>, order: &mut Vec<FieldDefinition>) -> ArborResult<()> {
        if cache.contains_key(name) {
            return Ok(());
        }
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(FieldError::CircularDependency { field: name.to_string() }.into()),
            None => {}
        }

        let definition = self.registry.get(name).ok_or_else(|| match requester {
            Some(field) => FieldError::DependencyNotFound {
                field: field.to_string(),
                dependency: name.to_string(),
            },
            None => FieldError::NotFound { field: name.to_string() },
        })?;

        marks.insert(name.to_string(), Mark::Visiting);
        for dependency in definition.dependencies() {
            self.visit(&dependency, Some(name), cache, marks, order)?;
        }
        marks.insert(name.to_string(), Mark::Done);
        order.push(definition.clone());
        Ok(())
    }

    fn compute(&self, definition: &FieldDefinition, columns: &mut BTreeMap<String, FieldValues>, cache: &FieldCache, len: usize) -> ArborResult<FieldArray> {
        let field = definition.name.as_str();
        let declared = match &definition.units {
            Some(expr) => Some(self.units.parse(expr).map_err(|source| FieldError::Units {
                field: field.to_string(),
                source,
            })?),
            None => None,
        };

        let array = match &definition.kind {
            FieldKind::Native | FieldKind::Analysis { saved: true, .. } => {
                let values = columns.remove(field).ok_or_else(|| BackendError::MissingField { field: field.to_string() })?;
                FieldArray::new(values, declared.clone().unwrap_or_default())
            }
            FieldKind::Analysis { default, saved: false } => FieldArray::new(FieldValues::filled(definition.dtype, len, *default), declared.clone().unwrap_or_default()),
            FieldKind::Alias { target } => cached(cache, field, target)?.clone(),
            FieldKind::Derived { function, .. } => {
                let ctx = FieldContext::new(field, cache, len, self.metadata, self.units);
                function(&ctx).map_err(|err| name_unit_error(field, err))?
            }
        };

        match declared {
            Some(units) if !array.units.is_equivalent(&units) => array.to_units(&units).map_err(|err| name_unit_error(field, err.into())),
            _ => Ok(array),
        }
    }
}

fn cached<'c>(cache: &'c FieldCache, field: &str, dependency: &str) -> ArborResult<&'c FieldArray> {
    cache.get(dependency).ok_or_else(|| {
        FieldError::DependencyNotFound {
            field: field.to_string(),
            dependency: dependency.to_string(),
        }
        .into()
    })
}

/// Attributes a unit conversion failure to the field being resolved.
fn name_unit_error(field: &str, err: ArborError) -> ArborError {
    match err {
        ArborError::Units(UnitError::DimensionMismatch { from, to }) => FieldError::DimensionMismatch {
            field: field.to_string(),
            from,
            to,
        }
        .into(),
        ArborError::Units(source) => FieldError::Units {
            field: field.to_string(),
            source,
        }
        .into(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{AliasDeclaration, FieldDeclarations, MemoryBackend};
    use crate::fields::{DataType, DerivedFunction};

    fn create_test_backend() -> MemoryBackend {
        MemoryBackend::builder("resolver")
            .column("uid", FieldValues::Int(vec![1, 2, 3]), "")
            .column("desc_uid", FieldValues::Int(vec![-1, 1, 1]), "")
            .column("Mvir", FieldValues::Float(vec![10.0, 4.0, 6.0]), "Msun/h")
            .column("Rvir", FieldValues::Float(vec![1.0, 2.0, 0.5]), "kpc")
            .build()
            .unwrap()
    }

    fn create_test_registry(backend: &MemoryBackend) -> FieldRegistry {
        let mut declarations: FieldDeclarations = backend.field_declarations();
        declarations.aliases.push(AliasDeclaration::new("mass", "Mvir", Some("Msun")));
        FieldRegistry::from_declarations(&declarations, UnitSystem::new(Some(0.5))).unwrap()
    }

    fn whole_forest(backend: &MemoryBackend) -> ForestLocation {
        backend.plant().unwrap().locations[0]
    }

    #[test]
    fn test_alias_converts_units() {
        let backend = create_test_backend();
        let registry = create_test_registry(&backend);
        let metadata = ArborMetadata::default();
        let location = whole_forest(&backend);

        let mut cache = FieldCache::new();
        Resolver::new(&registry, &backend, &metadata).resolve(RowSource::Forest(&location), &mut cache, &["mass".to_string()]).unwrap();
        assert_eq!(cache["mass"].as_f64_vec().unwrap(), vec![20.0, 8.0, 12.0]);
        assert!(cache.contains_key("Mvir"));
    }

    #[test]
    fn test_derived_dependencies_resolve_recursively() {
        let backend = create_test_backend();
        let mut registry = create_test_registry(&backend);
        let density: DerivedFunction = Arc::new(|ctx: &FieldContext<'_>| Ok(ctx.get("mass")?.div(&ctx.get("Rvir")?.powi(3))));
        registry.add_derived("density", vec!["mass".to_string(), "Rvir".to_string()], density, Some("Msun/kpc**3"), None, true).unwrap();

        let metadata = ArborMetadata::default();
        let location = whole_forest(&backend);
        let mut cache = FieldCache::new();
        Resolver::new(&registry, &backend, &metadata).resolve(RowSource::Forest(&location), &mut cache, &["density".to_string()]).unwrap();
        assert_eq!(cache["density"].as_f64_vec().unwrap(), vec![20.0, 1.0, 96.0]);
    }

    #[test]
    fn test_circular_dependency() {
        let backend = create_test_backend();
        let mut registry = create_test_registry(&backend);
        let passthrough = |dep: &'static str| -> DerivedFunction { Arc::new(move |ctx: &FieldContext<'_>| Ok(ctx.get(dep)?.clone())) };
        registry.add_derived("a", vec!["b".to_string()], passthrough("b"), None, None, true).unwrap();
        registry.add_derived("b", vec!["a".to_string()], passthrough("a"), None, None, true).unwrap();

        let metadata = ArborMetadata::default();
        let location = whole_forest(&backend);
        let mut cache = FieldCache::new();
        let err = Resolver::new(&registry, &backend, &metadata).resolve(RowSource::Forest(&location), &mut cache, &["a".to_string()]).unwrap_err();
        assert!(matches!(err, ArborError::Field(FieldError::CircularDependency { .. })));
    }

    #[test]
    fn test_missing_fields_are_named() {
        let backend = create_test_backend();
        let mut registry = create_test_registry(&backend);
        let metadata = ArborMetadata::default();
        let location = whole_forest(&backend);
        let resolver_err = |registry: &FieldRegistry, field: &str| {
            let mut cache = FieldCache::new();
            Resolver::new(registry, &backend, &metadata).resolve(RowSource::Forest(&location), &mut cache, &[field.to_string()]).unwrap_err()
        };

        assert!(matches!(resolver_err(&registry, "nope"), ArborError::Field(FieldError::NotFound { .. })));

        let function: DerivedFunction = Arc::new(|ctx: &FieldContext<'_>| Ok(ctx.get("ghost")?.clone()));
        registry.add_derived("haunted", vec!["ghost".to_string()], function, None, None, true).unwrap();
        match resolver_err(&registry, "haunted") {
            ArborError::Field(FieldError::DependencyNotFound { field, dependency }) => {
                assert_eq!(field, "haunted");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_names_field() {
        let backend = create_test_backend();
        let mut registry = create_test_registry(&backend);
        registry.add_alias("bad_mass", "Rvir", Some("Msun"), true).unwrap();

        let metadata = ArborMetadata::default();
        let location = whole_forest(&backend);
        let mut cache = FieldCache::new();
        let err = Resolver::new(&registry, &backend, &metadata).resolve(RowSource::Forest(&location), &mut cache, &["bad_mass".to_string(), "Mvir".to_string()]).unwrap_err();
        assert!(matches!(err, ArborError::Field(FieldError::DimensionMismatch { ref field, .. }) if field == "bad_mass"));
    }

    #[test]
    fn test_analysis_defaults() {
        let backend = create_test_backend();
        let mut registry = create_test_registry(&backend);
        registry.add_analysis("flag", "", -1.0, DataType::Int, None).unwrap();

        let metadata = ArborMetadata::default();
        let location = whole_forest(&backend);
        let mut cache = FieldCache::new();
        Resolver::new(&registry, &backend, &metadata).resolve(RowSource::Forest(&location), &mut cache, &["flag".to_string()]).unwrap();
        assert_eq!(cache["flag"].values, FieldValues::Int(vec![-1, -1, -1]));
    }

    #[test]
    fn test_root_reads_group_by_file() {
        let backend = MemoryBackend::builder("roots")
            .column("uid", FieldValues::Int(vec![1, 2, 3, 4, 5]), "")
            .column("desc_uid", FieldValues::Int(vec![-1, 1, -1, -1, 4]), "")
            .column("mass", FieldValues::Float(vec![1.0, 0.5, 3.0, 4.0, 0.4]), "")
            .files(2)
            .build()
            .unwrap();
        let registry = FieldRegistry::from_declarations(&backend.field_declarations(), UnitSystem::default()).unwrap();
        let metadata = ArborMetadata::default();
        let locations = backend.plant().unwrap().locations;

        let mut cache = FieldCache::new();
        Resolver::new(&registry, &backend, &metadata).resolve(RowSource::Roots(&locations), &mut cache, &["mass".to_string()]).unwrap();
        assert_eq!(cache["mass"].as_f64_vec().unwrap(), vec![1.0, 3.0, 4.0]);
        assert_eq!(backend.read_count(), 2);
    }
}
