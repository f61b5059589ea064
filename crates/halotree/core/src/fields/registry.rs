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

//! Field registry
//!
//! Every field name maps to up to one definition per kind. When a name has
//! several, the effective one is chosen by precedence: analysis, then derived,
//! then alias, then native. Dependencies are stored by name and only resolved
//! when a field is requested.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use halotree_common::{UnitSystem, Units};
use tracing::{debug, trace, warn};

use super::derived::{FieldContext, stock_derived_fields};
use super::vector::{STOCK_VECTOR_FIELDS, detect_vector_fields, magnitude_function, vector_function};
use super::{DataType, FieldArray};
use crate::backend::FieldDeclarations;
use crate::error::{ArborResult, FieldError};

/// Function computing a derived field from its dependencies.
pub type DerivedFunction = Arc<dyn Fn(&FieldContext<'_>) -> ArborResult<FieldArray> + Send + Sync>;

/// How a field is produced
#[derive(Clone)]
pub enum FieldKind {
    /// Read from the backend.
    Native,
    /// Another name for `target`.
    Alias { target: String },
    /// Computed from other fields.
    Derived { dependencies: Vec<String>, function: DerivedFunction },
    /// User-settable per-node value; `saved` fields are read back from the analysis layer.
    Analysis { default: f64, saved: bool },
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Native => "native",
            FieldKind::Alias { .. } => "alias",
            FieldKind::Derived { .. } => "derived",
            FieldKind::Analysis { .. } => "analysis",
        }
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Native => write!(f, "Native"),
            FieldKind::Alias { target } => f.debug_struct("Alias").field("target", target).finish(),
            FieldKind::Derived { dependencies, .. } => f.debug_struct("Derived").field("dependencies", dependencies).finish_non_exhaustive(),
            FieldKind::Analysis { default, saved } => f.debug_struct("Analysis").field("default", default).field("saved", saved).finish(),
        }
    }
}

/// One definition of a field name
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub name: String,
    pub kind: FieldKind,
    /// Units the resolved values are expressed in; `None` keeps the units of the source values.
    pub units: Option<String>,
    pub dtype: DataType,
    pub description: Option<String>,
    /// Component fields when this is a vector field.
    pub vector_components: Option<Vec<String>>,
}

impl FieldDefinition {
    pub fn native(name: impl Into<String>, units: impl Into<String>, dtype: DataType) -> Self {
        Self::new(name, FieldKind::Native, Some(units.into()), dtype)
    }

    pub fn analysis(name: impl Into<String>, units: impl Into<String>, default: f64, dtype: DataType) -> Self {
        Self::new(name, FieldKind::Analysis { default, saved: false }, Some(units.into()), dtype)
    }

    fn new(name: impl Into<String>, kind: FieldKind, units: Option<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            kind,
            units,
            dtype,
            description: None,
            vector_components: None,
        }
    }

    /// Names this definition reads from.
    pub fn dependencies(&self) -> Vec<String> {
        match &self.kind {
            FieldKind::Alias { target } => vec![target.clone()],
            FieldKind::Derived { dependencies, .. } => dependencies.clone(),
            FieldKind::Native | FieldKind::Analysis { .. } => Vec::new(),
        }
    }

    pub fn is_analysis(&self) -> bool {
        matches!(self.kind, FieldKind::Analysis { .. })
    }

    /// True when values come straight from the backend.
    pub fn is_stored(&self) -> bool {
        matches!(self.kind, FieldKind::Native | FieldKind::Analysis { saved: true, .. })
    }

    pub fn units_str(&self) -> &str {
        self.units.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
struct FieldSlot {
    native: Option<FieldDefinition>,
    alias: Option<FieldDefinition>,
    derived: Option<FieldDefinition>,
    analysis: Option<FieldDefinition>,
}

impl FieldSlot {
    fn effective(&self) -> Option<&FieldDefinition> {
        self.analysis.as_ref().or(self.derived.as_ref()).or(self.alias.as_ref()).or(self.native.as_ref())
    }

    fn layer_mut(&mut self, kind: &FieldKind) -> &mut Option<FieldDefinition> {
        match kind {
            FieldKind::Native => &mut self.native,
            FieldKind::Alias { .. } => &mut self.alias,
            FieldKind::Derived { .. } => &mut self.derived,
            FieldKind::Analysis { .. } => &mut self.analysis,
        }
    }
}

/// All field definitions known to an arbor
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    slots: BTreeMap<String, FieldSlot>,
    units: UnitSystem,
}

impl FieldRegistry {
    pub fn new(units: UnitSystem) -> Self {
        Self {
            slots: BTreeMap::new(),
            units,
        }
    }

    /// Builds the registry for a backend: natives, declared aliases, saved
    /// analysis fields, then the stock aliases, derived and vector fields.
    pub fn from_declarations(declarations: &FieldDeclarations, units: UnitSystem) -> ArborResult<Self> {
        let mut registry = Self::new(units);

        for native in &declarations.native {
            let mut definition = FieldDefinition::native(&native.name, &native.units, native.dtype);
            definition.description = native.description.clone();
            registry.insert(definition);
        }
        for saved in &declarations.analysis {
            let mut definition = FieldDefinition::new(
                &saved.name,
                FieldKind::Analysis {
                    default: saved.default,
                    saved: true,
                },
                Some(saved.units.clone()),
                saved.dtype,
            );
            definition.description = saved.description.clone();
            registry.insert(definition);
        }
        for alias in &declarations.aliases {
            if let Err(err) = registry.add_alias(&alias.alias, &alias.target, alias.units.as_deref(), false) {
                debug!("Skipping alias {}: {}", alias.alias, err);
            }
        }

        registry.setup_slash_aliases()?;
        registry.setup_stock_derived()?;
        registry.setup_vector_fields();
        Ok(registry)
    }

    pub fn unit_system(&self) -> UnitSystem {
        self.units
    }

    /// Effective definition of `name`.
    pub fn get(&self, name: &str) -> Option<&FieldDefinition> {
        self.slots.get(name).and_then(FieldSlot::effective)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Every field name, sorted.
    pub fn names(&self) -> Vec<String> {
        self.slots.iter().filter(|(_, slot)| slot.effective().is_some()).map(|(name, _)| name.clone()).collect()
    }

    /// Fields stored by the backend under their native names.
    pub fn field_list(&self) -> Vec<String> {
        self.slots.iter().filter(|(_, slot)| slot.native.is_some()).map(|(name, _)| name.clone()).collect()
    }

    /// Names whose effective definition is an alias or derived field.
    pub fn derived_field_list(&self) -> Vec<String> {
        self.names_where(|definition| matches!(definition.kind, FieldKind::Alias { .. } | FieldKind::Derived { .. }))
    }

    pub fn analysis_field_list(&self) -> Vec<String> {
        self.names_where(FieldDefinition::is_analysis)
    }

    /// Vector fields, excluding their magnitudes.
    pub fn vector_field_list(&self) -> Vec<String> {
        self.names_where(|definition| definition.vector_components.is_some())
    }

    fn names_where(&self, predicate: impl Fn(&FieldDefinition) -> bool) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.effective().filter(|d| predicate(d)).map(|_| name.clone()))
            .collect()
    }

    /// Aliases pointing at `target`.
    pub fn aliases_of(&self, target: &str) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| match slot.alias.as_ref().map(|d| &d.kind) {
                Some(FieldKind::Alias { target: t }) if t == target => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Vector fields (and their magnitudes) computed from `component`.
    pub fn vector_fields_using(&self, component: &str) -> Vec<String> {
        let mut names = Vec::new();
        for name in self.vector_field_list() {
            let uses = self.get(&name).and_then(|d| d.vector_components.as_ref()).is_some_and(|c| c.iter().any(|c| c == component));
            if uses {
                names.push(format!("{name}_magnitude"));
                names.push(name);
            }
        }
        names
    }

    /// Fields whose values depend on `name`, directly or through other fields.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            for (candidate, slot) in &self.slots {
                let Some(definition) = slot.effective() else { continue };
                if found.contains(candidate) || candidate == name {
                    continue;
                }
                if definition.dependencies().contains(&current) {
                    found.push(candidate.clone());
                    pending.push(candidate.clone());
                }
            }
        }
        found
    }

    /// Parsed units of the effective definition; aliases without declared units inherit from their target.
    pub fn units_of(&self, name: &str) -> Option<Units> {
        let definition = self.get(name)?;
        match (&definition.units, &definition.kind) {
            (Some(units), _) => self.units.parse(units).ok(),
            (None, FieldKind::Alias { target }) if target != name => self.units_of(target),
            _ => None,
        }
    }

    fn insert(&mut self, definition: FieldDefinition) -> Option<FieldDefinition> {
        let slot = self.slots.entry(definition.name.clone()).or_default();
        let layer = slot.layer_mut(&definition.kind);
        layer.replace(definition)
    }

    /// Adds `alias` for `target`. Without `force`, a missing target or an
    /// existing alias leaves the registry unchanged and returns false.
    pub fn add_alias(&mut self, alias: &str, target: &str, units: Option<&str>, force: bool) -> ArborResult<bool> {
        if !self.contains(target) {
            if force {
                return Err(FieldError::DependencyNotFound {
                    field: alias.to_string(),
                    dependency: target.to_string(),
                }
                .into());
            }
            return Ok(false);
        }

        let existing = self.slots.get(alias).and_then(|slot| slot.alias.as_ref());
        if existing.is_some() {
            if !force {
                return Ok(false);
            }
            warn!("Overriding alias {} for {}", alias, target);
        }

        let units = units.map(str::to_string).or_else(|| self.get(target).and_then(|d| d.units.clone()));
        let dtype = self.get(target).map_or(DataType::Float, |d| d.dtype);
        let mut definition = FieldDefinition::new(alias, FieldKind::Alias { target: target.to_string() }, units, dtype);
        definition.description = Some(format!("alias for {target}"));
        self.insert(definition);
        Ok(true)
    }

    /// Adds a derived field. With `force`, any existing definition of the name is overridden.
    pub fn add_derived(
        &mut self,
        name: &str,
        dependencies: Vec<String>,
        function: DerivedFunction,
        units: Option<&str>,
        description: Option<&str>,
        force: bool,
    ) -> ArborResult<bool> {
        if let Some(existing) = self.get(name) {
            if !force {
                return Ok(false);
            }
            warn!("Overriding field {} that already exists as {} field", name, existing.kind.name());
        }

        let mut definition = FieldDefinition::new(name, FieldKind::Derived { dependencies, function }, units.map(str::to_string), DataType::Float);
        definition.description = description.map(str::to_string);
        self.insert(definition);
        Ok(true)
    }

    /// Adds a settable analysis field.
    pub fn add_analysis(&mut self, name: &str, units: &str, default: f64, dtype: DataType, description: Option<&str>) -> ArborResult<()> {
        if self.contains(name) {
            return Err(FieldError::AlreadyExists { field: name.to_string() }.into());
        }
        self.units.parse(units).map_err(|source| FieldError::Units {
            field: name.to_string(),
            source,
        })?;

        let mut definition = FieldDefinition::analysis(name, units, default, dtype);
        definition.description = description.map(str::to_string);
        self.insert(definition);
        Ok(())
    }

    /// Registers `name` as a vector of `components` plus `<name>_magnitude`.
    pub fn add_vector_field(&mut self, name: &str, components: &[String]) -> ArborResult<()> {
        let mut expected: Option<(String, Units)> = None;
        for component in components {
            if !self.contains(component) {
                return Err(FieldError::DependencyNotFound {
                    field: name.to_string(),
                    dependency: component.clone(),
                }
                .into());
            }
            let units = self.units_of(component).unwrap_or_default();
            match &expected {
                None => expected = Some((component.clone(), units)),
                Some((_, first)) if !first.is_equivalent(&units) => {
                    return Err(FieldError::ConflictingComponentUnits {
                        field: name.to_string(),
                        component: component.clone(),
                        units: units.expr().to_string(),
                        expected: first.expr().to_string(),
                    }
                    .into());
                }
                Some(_) => {}
            }
        }
        let Some((first, units)) = expected else {
            return Err(FieldError::NotFound { field: name.to_string() }.into());
        };

        let units_expr = self.get(&first).and_then(|d| d.units.clone()).or_else(|| Some(units.expr().to_string()));
        let mut vector = FieldDefinition::new(
            name,
            FieldKind::Derived {
                dependencies: components.to_vec(),
                function: vector_function(name, components.to_vec()),
            },
            units_expr.clone(),
            DataType::Float,
        );
        vector.description = Some(format!("{name} vector"));
        vector.vector_components = Some(components.to_vec());
        self.insert(vector);

        let magnitude_name = format!("{name}_magnitude");
        let mut magnitude = FieldDefinition::new(
            &magnitude_name,
            FieldKind::Derived {
                dependencies: vec![name.to_string()],
                function: magnitude_function(name),
            },
            units_expr,
            DataType::Float,
        );
        magnitude.description = Some(format!("{name} magnitude"));
        self.insert(magnitude);

        debug!("Registered vector field {} from {:?}", name, components);
        Ok(())
    }

    /// Adds `_` spelled aliases for native names containing `/`.
    fn setup_slash_aliases(&mut self) -> ArborResult<()> {
        for name in self.field_list() {
            if name.contains('/') {
                let alias = name.replace('/', "_");
                if !self.add_alias(&alias, &name, None, false)? {
                    trace!("Alias {} for {} already defined", alias, name);
                }
            }
        }
        Ok(())
    }

    fn setup_stock_derived(&mut self) -> ArborResult<()> {
        for stock in stock_derived_fields() {
            if stock.dependencies.iter().all(|dep| self.contains(dep))
                && !self.add_derived(stock.name, stock.dependencies.clone(), stock.function.clone(), Some(stock.units), Some(stock.description), false)?
            {
                trace!("Keeping existing definition of {}", stock.name);
            }
        }
        Ok(())
    }

    /// Registers every complete x/y/z component set as a vector field.
    pub fn setup_vector_fields(&mut self) {
        let names = self.names();
        let mut candidates = detect_vector_fields(&names);
        for stock in STOCK_VECTOR_FIELDS {
            let components: Vec<String> = ["x", "y", "z"].iter().map(|c| format!("{stock}_{c}")).collect();
            if components.iter().all(|c| self.contains(c)) {
                candidates.entry(stock.to_string()).or_insert(components);
            }
        }

        for (name, components) in candidates {
            if self.contains(&name) {
                continue;
            }
            if let Err(err) = self.add_vector_field(&name, &components) {
                warn!("Not registering vector field {}: {}", name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AliasDeclaration, NativeField};

    fn test_declarations() -> FieldDeclarations {
        FieldDeclarations {
            native: vec![
                NativeField::new("uid", "", DataType::Int),
                NativeField::new("desc_uid", "", DataType::Int),
                NativeField::new("Mvir", "Msun/h", DataType::Float),
                NativeField::new("x", "Mpc/h", DataType::Float),
                NativeField::new("y", "Mpc/h", DataType::Float),
                NativeField::new("z", "Mpc/h", DataType::Float),
                NativeField::new("vx", "km/s", DataType::Float),
                NativeField::new("vy", "km/s", DataType::Float),
                NativeField::new("vz", "km/s", DataType::Float),
                NativeField::new("scale_factor", "", DataType::Float),
                NativeField::new("M200c/h", "Msun", DataType::Float),
            ],
            aliases: vec![
                AliasDeclaration::new("mass", "Mvir", Some("Msun")),
                AliasDeclaration::new("position_x", "x", Some("kpc")),
                AliasDeclaration::new("position_y", "y", Some("kpc")),
                AliasDeclaration::new("position_z", "z", Some("kpc")),
                AliasDeclaration::new("missing", "not_there", None),
            ],
            analysis: Vec::new(),
        }
    }

    fn create_test_registry() -> FieldRegistry {
        FieldRegistry::from_declarations(&test_declarations(), UnitSystem::new(Some(0.7))).unwrap()
    }

    #[test]
    fn test_declared_fields() {
        let registry = create_test_registry();
        assert!(registry.contains("mass"));
        assert!(!registry.contains("missing"));
        assert_eq!(registry.aliases_of("Mvir"), vec!["mass".to_string()]);
        assert!(registry.contains("M200c_h"));
        assert!(registry.contains("redshift"));
        assert!(registry.field_list().contains(&"Mvir".to_string()));
    }

    #[test]
    fn test_stock_registrations_keep_existing_definitions() {
        let mut declarations = test_declarations();
        declarations.native.push(NativeField::new("redshift", "", DataType::Float));
        declarations.aliases.push(AliasDeclaration::new("M200c_h", "Mvir", None));

        let registry = FieldRegistry::from_declarations(&declarations, UnitSystem::default()).unwrap();
        assert!(matches!(registry.get("M200c_h").unwrap().kind, FieldKind::Alias { ref target } if target == "Mvir"));
        assert!(matches!(registry.get("redshift").unwrap().kind, FieldKind::Native));
    }

    #[test]
    fn test_vector_detection() {
        let registry = create_test_registry();
        let vectors = registry.vector_field_list();
        assert!(vectors.contains(&"position".to_string()));
        assert!(vectors.contains(&"v".to_string()));
        assert!(registry.contains("position_magnitude"));
        assert!(registry.contains("v_magnitude"));
        assert_eq!(registry.get("position").unwrap().units_str(), "kpc");
        assert!(registry.vector_fields_using("vy").contains(&"v_magnitude".to_string()));
    }

    #[test]
    fn test_precedence() {
        let mut registry = create_test_registry();
        assert!(matches!(registry.get("mass").unwrap().kind, FieldKind::Alias { .. }));

        let function: DerivedFunction = Arc::new(|ctx: &FieldContext<'_>| Ok(ctx.get("Mvir")?.scale(2.0)));
        assert!(!registry.add_derived("mass", vec!["Mvir".to_string()], function.clone(), None, None, false).unwrap());
        assert!(registry.add_derived("mass", vec!["Mvir".to_string()], function, None, None, true).unwrap());
        assert!(matches!(registry.get("mass").unwrap().kind, FieldKind::Derived { .. }));
        assert!(registry.derived_field_list().contains(&"mass".to_string()));
    }

    #[test]
    fn test_analysis_fields() {
        let mut registry = create_test_registry();
        registry.add_analysis("stellar_mass", "Msun", 0.0, DataType::Float, None).unwrap();
        assert!(registry.get("stellar_mass").unwrap().is_analysis());

        let err = registry.add_analysis("Mvir", "Msun", 0.0, DataType::Float, None).unwrap_err();
        assert!(matches!(err, crate::ArborError::Field(FieldError::AlreadyExists { .. })));
        assert_eq!(registry.analysis_field_list(), vec!["stellar_mass".to_string()]);
    }

    #[test]
    fn test_conflicting_component_units() {
        let mut registry = create_test_registry();
        let components = vec!["x".to_string(), "vy".to_string()];
        let err = registry.add_vector_field("mixed", &components).unwrap_err();
        assert!(matches!(err, crate::ArborError::Field(FieldError::ConflictingComponentUnits { .. })));

        let err = registry.add_vector_field("absent", &["nothing".to_string()]).unwrap_err();
        assert!(matches!(err, crate::ArborError::Field(FieldError::DependencyNotFound { .. })));
    }

    #[test]
    fn test_explicit_vector_any_length() {
        let mut registry = create_test_registry();
        registry.add_vector_field("planar", &["x".to_string(), "y".to_string()]).unwrap();
        assert_eq!(registry.get("planar").unwrap().vector_components.as_ref().unwrap().len(), 2);
    }
}
