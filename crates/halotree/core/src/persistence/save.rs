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

//! Saving arbors
//!
//! Three modes share one entry point, [`Arbor::save`]:
//!
//! - a new container holding the selected trees and fields,
//! - an in-place update of the analysis sidecar of a canonical arbor, chosen
//!   automatically when every root is saved with no new filename or field list,
//! - a roots-only update that rewrites the analysis root index alone.
//!
//! Conflicting options are rejected before any file is touched. Values set on
//! node instances are saved when those instances are passed through
//! [`SaveOptions::trees`]; without it every root is indexed afresh.
//! Reload the container to observe what was written.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::format::{
    ARBOR_TYPE, AnalysisHeader, ColumnBlock, ContainerHeader, FORMAT_VERSION, ROOTS_MAGIC, SHARD_MAGIC, SavedField, ShardIndex, write_block, write_header,
};
use super::layout::ContainerLayout;
use crate::error::{ArborResult, FieldError, PersistenceError, SaveError};
use crate::fields::{DataType, FieldArray, FieldKind};
use crate::graph::{Arbor, Node};
use crate::traversal::Selection;

/// Options for [`Arbor::save`]
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Output directory (or header path) of a new container. Defaults to `arbor`.
    pub filename: Option<PathBuf>,
    pub fields: Option<Vec<String>>,
    pub trees: Option<Vec<Node>>,
    /// `Some(true)` forces an in-place update, `Some(false)` forbids it.
    pub in_place: Option<bool>,
    pub roots_only: bool,
    /// Nodes per shard before a new shard is started.
    pub max_file_size: Option<usize>,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn trees(mut self, trees: Vec<Node>) -> Self {
        self.trees = Some(trees);
        self
    }

    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = Some(in_place);
        self
    }

    pub fn roots_only(mut self, roots_only: bool) -> Self {
        self.roots_only = roots_only;
        self
    }

    pub fn max_file_size(mut self, max_file_size: usize) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SaveMode {
    Container,
    InPlace,
    RootsOnly,
}

/// Picks the save mode, rejecting conflicting options.
pub(crate) fn plan(arbor: &Arc<Arbor>, options: &SaveOptions) -> ArborResult<SaveMode> {
    let canonical = arbor.is_canonical();
    let size = arbor.size()?;
    if size == 0 {
        return Err(SaveError::NoTrees.into());
    }
    let covers_all = match &options.trees {
        None => true,
        Some(trees) => {
            if trees.is_empty() {
                return Err(SaveError::NoTrees.into());
            }
            if trees.iter().any(|tree| !Arc::ptr_eq(tree.arbor(), arbor)) {
                return Err(SaveError::ForeignTree.into());
            }
            trees.len() == size && trees.iter().enumerate().all(|(i, tree)| tree.tree_id() == 0 && tree.arbor_index() == i)
        }
    };

    if options.in_place == Some(true) {
        if !canonical {
            return Err(SaveError::InPlaceNotCanonical.into());
        }
        if options.roots_only {
            return Err(SaveError::InPlaceWithRootsOnly.into());
        }
        if options.filename.is_some() {
            return Err(SaveError::InPlaceWithFilename.into());
        }
        if !covers_all {
            return Err(SaveError::InPlaceWithSubset.into());
        }
        return Ok(SaveMode::InPlace);
    }
    if options.roots_only {
        if !canonical {
            return Err(SaveError::RootsOnlyNotCanonical.into());
        }
        if options.filename.is_some() {
            warn!("Roots-only save writes to the loaded container, ignoring the filename");
        }
        return Ok(SaveMode::RootsOnly);
    }

    let update = options.in_place.is_none() && canonical && covers_all && options.filename.is_none() && options.fields.is_none();
    Ok(if update { SaveMode::InPlace } else { SaveMode::Container })
}

/// Registry facts about a saved field, captured before reading any values.
#[derive(Debug, Clone)]
struct FieldPlan {
    name: String,
    description: Option<String>,
    default: Option<f64>,
}

/// Main and analysis columns of a new container. Natives with an alias are saved under the alias.
fn container_fields(arbor: &Arbor, requested: Option<&[String]>) -> ArborResult<(Vec<FieldPlan>, Vec<FieldPlan>)> {
    let registry = arbor.registry();
    let describe = |name: &str| -> ArborResult<FieldPlan> {
        let definition = registry.get(name).ok_or_else(|| FieldError::NotFound { field: name.to_string() })?;
        if definition.vector_components.is_some() {
            return Err(FieldError::NotScalar { field: name.to_string() }.into());
        }
        let default = match definition.kind {
            FieldKind::Analysis { default, .. } => Some(default),
            _ => None,
        };
        Ok(FieldPlan {
            name: name.to_string(),
            description: definition.description.clone(),
            default,
        })
    };
    let is_analysis = |name: &str| registry.get(name).is_some_and(|d| d.is_analysis());

    let mut main = Vec::new();
    let mut analysis = Vec::new();
    match requested {
        Some(fields) => {
            for required in ["uid", "desc_uid"] {
                if !fields.iter().any(|f| f == required) {
                    main.push(describe(required)?);
                }
            }
            for field in fields {
                let plan = describe(field)?;
                if is_analysis(field) { analysis.push(plan) } else { main.push(plan) }
            }
        }
        None => {
            for native in registry.field_list() {
                if is_analysis(&native) {
                    continue;
                }
                let alias = if native == "uid" || native == "desc_uid" {
                    None
                } else {
                    registry
                        .aliases_of(&native)
                        .into_iter()
                        .find(|alias| matches!(registry.get(alias).map(|d| &d.kind), Some(FieldKind::Alias { .. })))
                };
                let saved = alias.unwrap_or_else(|| native.clone());
                main.push(describe(&saved)?);
            }
            for field in registry.analysis_field_list() {
                analysis.push(describe(&field)?);
            }
        }
    }
    Ok((main, analysis))
}

fn saved_field(column: &FieldArray, plan: &FieldPlan) -> SavedField {
    SavedField {
        units: column.units.expr().to_string(),
        dtype: column.values.dtype().unwrap_or(DataType::Float),
        description: plan.description.clone(),
        default: plan.default,
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Accumulates trees into shards of a new container
struct ContainerWriter<'a> {
    layout: &'a ContainerLayout,
    main_fields: &'a [FieldPlan],
    analysis_fields: &'a [FieldPlan],
    shards: Vec<ShardIndex>,
    pending: ShardIndex,
    main: ColumnBlock,
    analysis: ColumnBlock,
    roots: ColumnBlock,
    analysis_roots: ColumnBlock,
    field_info: BTreeMap<String, SavedField>,
    analysis_info: BTreeMap<String, SavedField>,
    total_nodes: usize,
}

impl<'a> ContainerWriter<'a> {
    fn new(layout: &'a ContainerLayout, main_fields: &'a [FieldPlan], analysis_fields: &'a [FieldPlan]) -> Self {
        Self {
            layout,
            main_fields,
            analysis_fields,
            shards: Vec::new(),
            pending: ShardIndex {
                tree_start: 0,
                tree_end: 0,
                tree_sizes: Vec::new(),
            },
            main: ColumnBlock::default(),
            analysis: ColumnBlock::default(),
            roots: ColumnBlock::default(),
            analysis_roots: ColumnBlock::default(),
            field_info: BTreeMap::new(),
            analysis_info: BTreeMap::new(),
            total_nodes: 0,
        }
    }

    fn pending_nodes(&self) -> usize {
        self.pending.node_count()
    }

    fn add_tree(&mut self, tree: &Node) -> ArborResult<()> {
        // An entry root carries its whole forest; any other node only its own tree.
        let selection = if tree.tree_id() == 0 { Selection::Forest } else { Selection::Tree };
        let mut size = 0;

        for plan in self.main_fields {
            let mut column = tree.selection_field(selection, &plan.name)?;
            if plan.name == "desc_uid" && !column.is_empty() {
                column.values.set(0, &halotree_common::NO_DESCENDANT.into());
            }
            size = column.len();
            self.field_info.entry(plan.name.clone()).or_insert_with(|| saved_field(&column, plan));
            self.main.append(&plan.name, &column.values);
            self.roots.append(&plan.name, &column.values.select_rows(&plan.name, &[0])?);
        }
        for plan in self.analysis_fields {
            let column = tree.selection_field(selection, &plan.name)?;
            self.analysis_info.entry(plan.name.clone()).or_insert_with(|| saved_field(&column, plan));
            self.analysis.append(&plan.name, &column.values);
            self.analysis_roots.append(&plan.name, &column.values.select_rows(&plan.name, &[0])?);
        }

        self.pending.tree_sizes.push(size);
        self.pending.tree_end += 1;
        self.total_nodes += size;
        Ok(())
    }

    fn flush(&mut self) -> ArborResult<()> {
        if self.pending.tree_sizes.is_empty() {
            return Ok(());
        }
        let index = self.shards.len();
        write_block(&self.layout.shard_path(index), SHARD_MAGIC, &self.main)?;
        if !self.analysis_fields.is_empty() {
            write_block(&self.layout.analysis_shard_path(index), SHARD_MAGIC, &self.analysis)?;
        }
        info!("Saved shard {} with {} trees ({} nodes)", index, self.pending.tree_sizes.len(), self.pending_nodes());

        let next = self.pending.tree_end;
        let finished = std::mem::replace(
            &mut self.pending,
            ShardIndex {
                tree_start: next,
                tree_end: next,
                tree_sizes: Vec::new(),
            },
        );
        self.shards.push(finished);
        self.main = ColumnBlock::default();
        self.analysis = ColumnBlock::default();
        Ok(())
    }

    fn finish(mut self, arbor: &Arbor) -> ArborResult<PathBuf> {
        self.flush()?;
        let layout = self.layout;
        write_block(&layout.roots_path(), ROOTS_MAGIC, &self.roots)?;

        let analysis_header_path = layout.analysis_header_path();
        if self.analysis_fields.is_empty() {
            for stale in [analysis_header_path, layout.analysis_roots_path()] {
                if stale.exists() {
                    fs::remove_file(&stale).map_err(|e| io_error(&stale, e))?;
                }
            }
        } else {
            write_block(&layout.analysis_roots_path(), ROOTS_MAGIC, &self.analysis_roots)?;
            write_header(
                &analysis_header_path,
                &AnalysisHeader {
                    format_version: FORMAT_VERSION,
                    fields: self.analysis_info,
                },
            )?;
        }
        remove_stale_shards(layout, self.shards.len())?;

        let header = ContainerHeader {
            format_version: FORMAT_VERSION,
            arbor_type: ARBOR_TYPE.to_string(),
            source_name: arbor.name().to_string(),
            source_format: arbor.backend().format().to_string(),
            metadata: arbor.metadata().clone(),
            fields: self.field_info,
            total_files: self.shards.len(),
            total_trees: self.shards.last().map_or(0, |shard| shard.tree_end),
            total_nodes: self.total_nodes,
            shards: self.shards,
        };
        let header_path = layout.header_path();
        write_header(&header_path, &header)?;
        info!("Saved {} trees ({} nodes) to {}", header.total_trees, header.total_nodes, header_path.display());
        Ok(header_path)
    }
}

/// Removes shards left behind by an earlier, larger save to the same place.
fn remove_stale_shards(layout: &ContainerLayout, count: usize) -> ArborResult<()> {
    let existing = layout.list_shards().map_err(|e| io_error(layout.directory(), e))?;
    for index in existing.into_iter().filter(|index| *index >= count) {
        for path in [layout.shard_path(index), layout.analysis_shard_path(index)] {
            if path.exists() {
                debug!("Removing stale shard {}", path.display());
                fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
            }
        }
    }
    Ok(())
}

fn selected_trees(arbor: &Arc<Arbor>, options: &SaveOptions) -> ArborResult<Vec<Node>> {
    match &options.trees {
        Some(trees) => Ok(trees.clone()),
        None => arbor.roots(0..arbor.size()?),
    }
}

fn save_container(arbor: &Arc<Arbor>, options: &SaveOptions) -> ArborResult<Option<PathBuf>> {
    let (main_fields, analysis_fields) = container_fields(arbor, options.fields.as_deref())?;
    let output = options.filename.clone().unwrap_or_else(|| PathBuf::from("arbor"));
    let layout = ContainerLayout::from_output(&output);
    if arbor.backend().source_path() == Some(layout.header_path().as_path()) {
        return Err(SaveError::OverwritesSource.into());
    }

    let trees = selected_trees(arbor, options)?;
    let max_file_size = options.max_file_size.unwrap_or(arbor.config().max_file_size).max(1);
    layout.ensure_directory().map_err(|e| io_error(layout.directory(), e))?;
    debug!("Saving {} trees of {} to {}", trees.len(), arbor.name(), layout.directory().display());

    let mut writer = ContainerWriter::new(&layout, &main_fields, &analysis_fields);
    for tree in &trees {
        writer.add_tree(tree)?;
        if writer.pending_nodes() >= max_file_size {
            writer.flush()?;
        }
    }
    Ok(Some(writer.finish(arbor)?))
}

fn analysis_plans(arbor: &Arbor) -> ArborResult<Vec<FieldPlan>> {
    let fields = arbor.analysis_field_list();
    Ok(container_fields(arbor, Some(&fields))?.1)
}

fn save_in_place(arbor: &Arc<Arbor>, options: &SaveOptions) -> ArborResult<Option<PathBuf>> {
    let plans = analysis_plans(arbor)?;
    if plans.is_empty() {
        warn!("No analysis fields to save for {}, nothing written", arbor.name());
        return Ok(None);
    }
    let source = arbor.backend().source_path().ok_or(SaveError::InPlaceNotCanonical)?.to_path_buf();
    let layout = ContainerLayout::from_header(&source);

    let mut trees = selected_trees(arbor, options)?;
    trees.sort_by_key(Node::arbor_index);
    let planted = arbor.planted()?;

    let mut info_map = BTreeMap::new();
    let mut roots = ColumnBlock::default();
    let mut block = ColumnBlock::default();
    let mut current_file = None;
    for tree in &trees {
        let file = planted.locations[tree.arbor_index()].file;
        if let Some(previous) = current_file
            && previous != file
        {
            write_block(&layout.analysis_shard_path(previous), SHARD_MAGIC, &block)?;
            block = ColumnBlock::default();
        }
        current_file = Some(file);

        for plan in &plans {
            let column = tree.selection_field(Selection::Forest, &plan.name)?;
            info_map.entry(plan.name.clone()).or_insert_with(|| saved_field(&column, plan));
            block.append(&plan.name, &column.values);
            roots.append(&plan.name, &column.values.select_rows(&plan.name, &[0])?);
        }
    }
    if let Some(file) = current_file {
        write_block(&layout.analysis_shard_path(file), SHARD_MAGIC, &block)?;
    }

    write_block(&layout.analysis_roots_path(), ROOTS_MAGIC, &roots)?;
    write_header(
        &layout.analysis_header_path(),
        &AnalysisHeader {
            format_version: FORMAT_VERSION,
            fields: info_map,
        },
    )?;
    info!("Updated {} analysis fields of {} in place", plans.len(), source.display());
    Ok(Some(source))
}

fn save_roots_only(arbor: &Arc<Arbor>, options: &SaveOptions) -> ArborResult<Option<PathBuf>> {
    let plans = analysis_plans(arbor)?;
    if plans.is_empty() {
        warn!("No analysis fields to save for {}, nothing written", arbor.name());
        return Ok(None);
    }
    let source = arbor.backend().source_path().ok_or(SaveError::RootsOnlyNotCanonical)?.to_path_buf();
    let layout = ContainerLayout::from_header(&source);

    let mut info_map = BTreeMap::new();
    let mut roots = ColumnBlock::default();
    for plan in &plans {
        let mut column = arbor.field(&plan.name)?;
        for tree in options.trees.iter().flatten() {
            if tree.tree_id() != 0 {
                warn!("Skipping {} in roots-only save, it is not the root of its entry", tree);
                continue;
            }
            let value = tree.get(&plan.name)?.value;
            column.values.set(tree.arbor_index(), &value);
        }
        info_map.insert(plan.name.clone(), saved_field(&column, plan));
        roots.fields.insert(plan.name.clone(), column.values);
    }

    write_block(&layout.analysis_roots_path(), ROOTS_MAGIC, &roots)?;
    write_header(
        &layout.analysis_header_path(),
        &AnalysisHeader {
            format_version: FORMAT_VERSION,
            fields: info_map,
        },
    )?;
    info!("Updated root analysis fields of {}", source.display());
    Ok(Some(source))
}

impl Arbor {
    /// Saves the arbor. Returns the header path written, or `None` when there was nothing to write.
    pub fn save(self: &Arc<Self>, options: SaveOptions) -> ArborResult<Option<PathBuf>> {
        match plan(self, &options)? {
            SaveMode::Container => save_container(self, &options),
            SaveMode::InPlace => save_in_place(self, &options),
            SaveMode::RootsOnly => save_roots_only(self, &options),
        }
    }
}

impl Node {
    /// Saves the tree beneath this node as a new container.
    pub fn save_tree(&self, filename: impl Into<PathBuf>, fields: Option<Vec<String>>) -> ArborResult<Option<PathBuf>> {
        let options = SaveOptions {
            filename: Some(filename.into()),
            fields,
            trees: Some(vec![self.clone()]),
            in_place: Some(false),
            ..Default::default()
        };
        self.arbor().save(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArborError;
    use crate::backend::MemoryBackend;
    use crate::fields::FieldValues;

    fn create_test_arbor() -> Arc<Arbor> {
        let backend = MemoryBackend::builder("save")
            .column("uid", FieldValues::Int(vec![1, 2, 3, 10]), "")
            .column("desc_uid", FieldValues::Int(vec![-1, 1, 1, -1]), "")
            .column("mass", FieldValues::Float(vec![10.0, 4.0, 6.0, 3.0]), "Msun")
            .build()
            .unwrap();
        Arbor::new(backend).unwrap()
    }

    #[test]
    fn test_conflicts_on_non_canonical() {
        let arbor = create_test_arbor();
        let err = |options: SaveOptions| match arbor.save(options) {
            Err(ArborError::Save(err)) => err,
            other => panic!("expected a save error, got {other:?}"),
        };
        assert_eq!(err(SaveOptions::new().in_place(true)), SaveError::InPlaceNotCanonical);
        assert_eq!(err(SaveOptions::new().roots_only(true)), SaveError::RootsOnlyNotCanonical);
        assert_eq!(err(SaveOptions::new().trees(Vec::new())), SaveError::NoTrees);

        let other = create_test_arbor();
        assert_eq!(err(SaveOptions::new().trees(vec![other.root(0).unwrap()])), SaveError::ForeignTree);
    }

    #[test]
    fn test_default_fields_use_aliases() {
        let arbor = create_test_arbor();
        arbor.add_alias_field("Mvir", "mass", None).unwrap();
        let (main, analysis) = container_fields(&arbor, None).unwrap();
        let saved: Vec<&str> = main.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(saved, vec!["desc_uid", "Mvir", "uid"]);
        assert!(analysis.is_empty());

        let (main, _) = container_fields(&arbor, Some(&["mass".to_string()])).unwrap();
        let saved: Vec<&str> = main.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(saved, vec!["uid", "desc_uid", "mass"]);
        assert!(container_fields(&arbor, Some(&["nope".to_string()])).is_err());
    }
}
