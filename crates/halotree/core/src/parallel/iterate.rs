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

//! Parallel iteration over trees and their nodes
//!
//! Workers never touch the caller's node instances. Each worker regenerates
//! the trees it is given from the shared arbor, runs the user function on
//! those private instances and, when results are collected, reads the
//! analysis fields back out. Private instances start from the analysis
//! values the caller's instances already hold. The coordinating thread writes the collected
//! values into the caller's nodes by `(entry, row)` and then saves.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::context::ExecutionContext;
use super::distribute::distribute_with_state;
use crate::error::{ArborResult, FieldError, ParallelError, SaveError};
use crate::fields::{FieldKind, FieldValues};
use crate::graph::{Arbor, Node};
use crate::load::{LoadOptions, load};
use crate::persistence::SaveOptions;
use crate::persistence::save::plan;
use crate::traversal::Selection;

/// When collected results are written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveEvery {
    /// Collect results but never save.
    Never,
    /// Save once after every tree is done.
    #[default]
    End,
    /// Save after every `n` trees.
    Every(usize),
}

#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Gather analysis results on the coordinating thread. Required for saving.
    pub collect_results: bool,
    pub save_every: SaveEvery,
    pub save_in_place: Option<bool>,
    /// Collect and save only the values of each tree's own node.
    pub save_roots_only: bool,
    pub filename: Option<PathBuf>,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            collect_results: true,
            save_every: SaveEvery::End,
            save_in_place: None,
            save_roots_only: false,
            filename: None,
        }
    }
}

impl ParallelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect_results(mut self, collect: bool) -> Self {
        self.collect_results = collect;
        self
    }

    pub fn save_every(mut self, save_every: SaveEvery) -> Self {
        self.save_every = save_every;
        self
    }

    pub fn save_in_place(mut self, in_place: bool) -> Self {
        self.save_in_place = Some(in_place);
        self
    }

    pub fn save_roots_only(mut self, roots_only: bool) -> Self {
        self.save_roots_only = roots_only;
        self
    }

    pub fn filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Trees per batch and whether batches are saved.
    fn batching(&self, total: usize) -> ArborResult<(usize, bool)> {
        match self.save_every {
            SaveEvery::Every(_) if !self.collect_results => Err(ParallelError::SaveWithoutCollect.into()),
            SaveEvery::Every(0) => Err(ParallelError::InvalidContext("save_every must be at least one tree".to_string()).into()),
            SaveEvery::Every(n) => Ok((n, true)),
            SaveEvery::Never => Ok((total, false)),
            SaveEvery::End => Ok((total, self.collect_results)),
        }
    }
}

/// Result of a parallel iteration over trees
#[derive(Debug)]
pub struct ParallelOutcome<R> {
    /// Value returned by the user function for every tree, in input order.
    pub results: Vec<R>,
    /// Containers written, in order.
    pub saved: Vec<PathBuf>,
    /// The trees as seen by the last arbor, reloaded after each save.
    pub trees: Vec<Node>,
}

impl<R> ParallelOutcome<R> {
    pub fn arbor(&self) -> Option<&Arc<Arbor>> {
        self.trees.first().map(Node::arbor)
    }
}

/// Analysis values read back from a worker's private tree
struct CollectedValues {
    key: (usize, usize),
    rows: Vec<usize>,
    fields: Vec<(String, FieldValues)>,
}

/// Private node instances of one worker, regenerated from the shared arbor
#[derive(Default)]
struct LocalForests {
    root: Option<Node>,
}

impl LocalForests {
    fn local(&mut self, node: &Node) -> ArborResult<Node> {
        let root = match &self.root {
            Some(root) if root.arbor_index() == node.arbor_index() && Arc::ptr_eq(root.arbor(), node.arbor()) => root.clone(),
            _ => {
                let root = node.arbor().root(node.arbor_index())?;
                self.root = Some(root.clone());
                root
            }
        };
        if node.tree_id() == 0 {
            return Ok(root);
        }
        let links = root.links()?;
        Ok(root.at_row(&links, node.tree_id()))
    }
}

/// Copies analysis values already held by the caller's instance into the worker's instance.
fn seed_values(source: &Node, local: &Node, rows: &[usize], fields: &[String]) -> ArborResult<()> {
    if Arc::ptr_eq(source.forest_state(), local.forest_state()) {
        return Ok(());
    }
    for field in fields {
        if let Some(values) = source.forest_state().cached_rows(field, rows)? {
            let dependents = local.arbor().registry().dependents_of(field);
            local.forest_state().set_rows(local.arbor(), field, rows, &values)?;
            local.forest_state().invalidate(&dependents);
        }
    }
    Ok(())
}

fn collect_values(node: &Node, rows: Vec<usize>, fields: &[String]) -> ArborResult<CollectedValues> {
    let mut collected = Vec::with_capacity(fields.len());
    for field in fields {
        let values = node.forest_state().with_column(node.arbor(), field, |column| column.values.select_rows(field, &rows))??;
        collected.push((field.clone(), values));
    }
    Ok(CollectedValues {
        key: (node.arbor_index(), node.tree_id()),
        rows,
        fields: collected,
    })
}

fn tree_rows(tree: &Node, roots_only: bool) -> ArborResult<Vec<usize>> {
    if roots_only {
        Ok(vec![tree.tree_id()])
    } else if tree.tree_id() == 0 {
        tree.selection_rows(Selection::Forest)
    } else {
        tree.selection_rows(Selection::Tree)
    }
}

fn write_back(target: &Node, collected: &CollectedValues) -> ArborResult<()> {
    for (field, values) in &collected.fields {
        target.assign_rows(field, &collected.rows, values)?;
    }
    Ok(())
}

fn check_trees(trees: &[Node]) -> ArborResult<Option<Arc<Arbor>>> {
    let Some(first) = trees.first() else {
        return Ok(None);
    };
    let arbor = first.arbor().clone();
    if trees.iter().any(|tree| !Arc::ptr_eq(tree.arbor(), &arbor)) {
        return Err(SaveError::ForeignTree.into());
    }
    Ok(Some(arbor))
}

/// Re-opens a freshly saved container, carrying over user-registered derived fields and the selector.
fn reload(previous: &Arc<Arbor>, path: &Path) -> ArborResult<Arc<Arbor>> {
    let reloaded = load(path, LoadOptions::new().config(previous.config().clone()))?;
    let carried: Vec<_> = {
        let registry = previous.registry();
        registry
            .derived_field_list()
            .into_iter()
            .filter(|name| !reloaded.has_field(name))
            .filter_map(|name| registry.get(&name).cloned())
            .collect()
    };
    for definition in carried {
        if let FieldKind::Derived { dependencies, function } = &definition.kind {
            let dependencies: Vec<&str> = dependencies.iter().map(String::as_str).collect();
            reloaded.add_derived_field(&definition.name, &dependencies, function.clone(), definition.units.as_deref(), definition.description.as_deref())?;
        }
    }
    reloaded.set_selector_impl(previous.selector());
    Ok(reloaded)
}

/// Runs `work` on every tree in parallel, gathering and saving analysis results as `options` asks.
///
/// `init` builds the private state of each worker from its worker number.
pub fn parallel_trees<S, R, I, F>(trees: &[Node], context: &ExecutionContext, options: &ParallelOptions, init: I, work: F) -> ArborResult<ParallelOutcome<R>>
where
    R: Send,
    I: Fn(usize) -> S + Sync,
    F: Fn(&mut S, &Node) -> ArborResult<R> + Sync,
{
    context.validate()?;
    let Some(mut arbor) = check_trees(trees)? else {
        return Ok(ParallelOutcome {
            results: Vec::new(),
            saved: Vec::new(),
            trees: Vec::new(),
        });
    };
    let (batch_size, do_save) = options.batching(trees.len())?;

    let mut save_options = SaveOptions {
        filename: options.filename.clone(),
        in_place: options.save_in_place,
        roots_only: options.save_roots_only,
        ..SaveOptions::default()
    };
    if do_save {
        plan(&arbor, &SaveOptions { trees: Some(trees.to_vec()), ..save_options.clone() })?;
    }

    let mut current: Vec<Node> = trees.to_vec();
    let mut results = Vec::with_capacity(trees.len());
    let mut saved = Vec::new();
    let mut start = 0;
    while start < current.len() {
        let end = (start + batch_size).min(current.len());
        let batch = &current[start..end];
        let fields = arbor.analysis_field_list();
        debug!("Processing trees {}..{} of {}", start, end, current.len());

        let outputs = distribute_with_state(
            batch,
            context.outer_workers(),
            context.distribution,
            |worker| (init(worker), LocalForests::default()),
            |worker: &mut (S, LocalForests), _, tree: &Node| {
                let (state, forests) = worker;
                let local = forests.local(tree)?;
                if options.collect_results {
                    seed_values(tree, &local, &tree_rows(&local, false)?, &fields)?;
                }
                let result = work(state, &local)?;
                let collected = if options.collect_results { Some(collect_values(&local, tree_rows(&local, options.save_roots_only)?, &fields)?) } else { None };
                Ok((result, collected))
            },
        )?;

        let mut by_key = HashMap::with_capacity(outputs.len());
        for (result, collected) in outputs {
            results.push(result);
            if let Some(collected) = collected {
                by_key.insert(collected.key, collected);
            }
        }
        if options.collect_results {
            for tree in batch {
                let key = (tree.arbor_index(), tree.tree_id());
                if let Some(collected) = by_key.get(&key) {
                    write_back(tree, collected)?;
                }
            }
        }

        if do_save {
            let options_now = SaveOptions { trees: Some(current.clone()), ..save_options.clone() };
            if let Some(path) = arbor.save(options_now)? {
                info!("Saved results for {} trees to {}", end, path.display());
                let in_place = arbor.backend().source_path() == Some(path.as_path());
                let reloaded = reload(&arbor, &path)?;
                current = current
                    .iter()
                    .enumerate()
                    .map(|(i, tree)| if in_place { reloaded.root(tree.arbor_index()) } else { reloaded.root(i) })
                    .collect::<ArborResult<Vec<Node>>>()?;
                arbor = reloaded;
                saved.push(path);
                save_options.filename = None;
                if !save_options.roots_only {
                    save_options.in_place = None;
                }
            }
        }
        start = end;
    }

    Ok(ParallelOutcome { results, saved, trees: current })
}

/// Runs `work` on the nodes of one tree in parallel, writing collected analysis values back into `tree`.
///
/// `nodes` overrides `selection` and must belong to the forest of `tree`. Nothing is saved.
pub fn parallel_tree_nodes<S, R, I, F>(tree: &Node, selection: Selection, nodes: Option<&[Node]>, context: &ExecutionContext, init: I, work: F) -> ArborResult<Vec<R>>
where
    R: Send,
    I: Fn(usize) -> S + Sync,
    F: Fn(&mut S, &Node) -> ArborResult<R> + Sync,
{
    context.validate()?;
    let nodes = match nodes {
        Some(nodes) => {
            if let Some(stray) = nodes.iter().find(|node| !Arc::ptr_eq(node.arbor(), tree.arbor()) || node.arbor_index() != tree.arbor_index()) {
                return Err(ParallelError::InvalidContext(format!("{stray} is not part of {tree}")).into());
            }
            nodes.to_vec()
        }
        None => tree.selection_nodes(selection)?,
    };
    let fields = tree.arbor().analysis_field_list();

    let outputs = distribute_with_state(
        &nodes,
        context.workers,
        context.distribution,
        |worker| (init(worker), LocalForests::default()),
        |worker: &mut (S, LocalForests), _, node: &Node| {
            let (state, forests) = worker;
            let local = forests.local(node)?;
            seed_values(node, &local, &[node.tree_id()], &fields)?;
            let result = work(state, &local)?;
            let collected = collect_values(&local, vec![local.tree_id()], &fields)?;
            Ok((result, collected))
        },
    )?;

    let mut results = Vec::with_capacity(outputs.len());
    let mut by_field: BTreeMap<&str, (Vec<usize>, Option<FieldValues>)> = BTreeMap::new();
    let mut collected_all = Vec::with_capacity(outputs.len());
    for (result, collected) in outputs {
        results.push(result);
        collected_all.push(collected);
    }
    collected_all.sort_by_key(|collected| collected.key);
    for collected in &collected_all {
        for (field, values) in &collected.fields {
            let (rows, combined) = by_field.entry(field.as_str()).or_default();
            rows.extend(&collected.rows);
            match combined {
                Some(existing) => existing.extend(values),
                None => *combined = Some(values.clone()),
            }
        }
    }
    for (field, (rows, values)) in by_field {
        let values = values.ok_or_else(|| FieldError::NotFound { field: field.to_string() })?;
        tree.assign_rows(field, &rows, &values)?;
    }
    Ok(results)
}

/// Two-level iteration: trees spread over `context.outer_workers()` groups, the nodes of each tree over the group's threads.
pub fn parallel_nodes<S, R, I, F>(trees: &[Node], selection: Selection, context: &ExecutionContext, options: &ParallelOptions, init: I, work: F) -> ArborResult<ParallelOutcome<Vec<R>>>
where
    R: Send,
    I: Fn(usize) -> S + Sync,
    F: Fn(&mut S, &Node) -> ArborResult<R> + Sync,
{
    let inner = context.inner();
    let tree_options = ParallelOptions {
        save_roots_only: false,
        ..options.clone()
    };
    parallel_trees(trees, context, &tree_options, |_| (), |_, tree| parallel_tree_nodes(tree, selection, None, &inner, &init, &work))
}
