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

//! Ordered analysis operations over nodes
//!
//! An operation may act as a filter by returning `Some(false)`. Once the
//! filter is cleared, the remaining operations only run if they are marked
//! `always_do`. A cleared filter stays cleared for the rest of the target.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{ArborResult, PipelineError};
use crate::graph::Node;

/// Attribute attached to a target by an operation.
pub type Attribute = Box<dyn Any + Send>;

/// Function run for every target.
pub type OperationFn = Box<dyn FnMut(&mut AnalysisTarget, &OperationContext<'_>) -> ArborResult<Option<bool>> + Send>;

/// One-time setup run before the first target.
pub type PreprocessFn = Box<dyn FnOnce() -> ArborResult<()> + Send>;

/// A node going through a pipeline, plus attributes attached along the way
pub struct AnalysisTarget {
    node: Node,
    attrs: HashMap<String, Attribute>,
}

impl AnalysisTarget {
    pub fn new(node: Node) -> Self {
        Self { node, attrs: HashMap::new() }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }

    pub fn set_attr<T: Any + Send>(&mut self, name: impl Into<String>, value: T) {
        self.attrs.insert(name.into(), Box::new(value));
    }

    pub fn attr<T: Any>(&self, name: &str) -> Option<&T> {
        self.attrs.get(name).and_then(|value| value.downcast_ref())
    }

    pub fn attr_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.attrs.get_mut(name).and_then(|value| value.downcast_mut())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<Attribute> {
        self.attrs.remove(name)
    }

    fn insert_raw(&mut self, name: String, value: Attribute) {
        self.attrs.insert(name, value);
    }
}

impl From<Node> for AnalysisTarget {
    fn from(node: Node) -> Self {
        Self::new(node)
    }
}

impl fmt::Debug for AnalysisTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut attrs: Vec<&String> = self.attrs.keys().collect();
        attrs.sort();
        f.debug_struct("AnalysisTarget").field("node", &self.node).field("attrs", &attrs).finish()
    }
}

/// What an operation knows about where it runs
#[derive(Debug, Clone, Copy)]
pub struct OperationContext<'a> {
    output_dir: Option<&'a Path>,
}

impl<'a> OperationContext<'a> {
    /// Output directory of the operation, created before the first target.
    pub fn output_dir(&self) -> Option<&'a Path> {
        self.output_dir
    }
}

pub struct Operation {
    name: String,
    function: OperationFn,
    always_do: bool,
    output_dir: Option<PathBuf>,
    preprocess: Option<PreprocessFn>,
}

impl Operation {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: FnMut(&mut AnalysisTarget, &OperationContext<'_>) -> ArborResult<Option<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
            always_do: false,
            output_dir: None,
            preprocess: None,
        }
    }

    /// An operation that acts only through side effects and never filters.
    pub fn action<F>(name: impl Into<String>, mut function: F) -> Self
    where
        F: FnMut(&mut AnalysisTarget) -> ArborResult<()> + Send + 'static,
    {
        Self::new(name, move |target, _| function(target).map(|_| None))
    }

    /// An operation that only filters.
    pub fn filter<F>(name: impl Into<String>, mut predicate: F) -> Self
    where
        F: FnMut(&Node) -> ArborResult<bool> + Send + 'static,
    {
        Self::new(name, move |target, _| predicate(target.node()).map(Some))
    }

    /// Runs even after an earlier operation cleared the filter.
    pub fn always_do(mut self, always_do: bool) -> Self {
        self.always_do = always_do;
        self
    }

    /// Subdirectory of the pipeline output directory handed to the operation.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn preprocess<F>(mut self, function: F) -> Self
    where
        F: FnOnce() -> ArborResult<()> + Send + 'static,
    {
        self.preprocess = Some(Box::new(function));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_always_do(&self) -> bool {
        self.always_do
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("always_do", &self.always_do)
            .field("output_dir", &self.output_dir)
            .field("preprocess", &self.preprocess.is_some())
            .finish_non_exhaustive()
    }
}

/// Adds a group of operations to a pipeline
pub trait Recipe {
    fn add_to(self, pipeline: &mut AnalysisPipeline);
}

impl<F> Recipe for F
where
    F: FnOnce(&mut AnalysisPipeline),
{
    fn add_to(self, pipeline: &mut AnalysisPipeline) {
        self(pipeline)
    }
}

pub struct AnalysisPipeline {
    output_dir: PathBuf,
    operations: Vec<Operation>,
    /// Resolved output directory of every operation.
    resolved_dirs: Vec<Option<PathBuf>>,
    preprocessed: bool,
    handoff: HashMap<String, Attribute>,
}

impl AnalysisPipeline {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            operations: Vec::new(),
            resolved_dirs: Vec::new(),
            preprocessed: false,
            handoff: HashMap::new(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn add_operation(&mut self, operation: Operation) -> &mut Self {
        self.operations.push(operation);
        self.preprocessed = false;
        self
    }

    pub fn add_recipe(&mut self, recipe: impl Recipe) -> &mut Self {
        recipe.add_to(self);
        self
    }

    /// Adds a recipe, marking every operation it adds `always_do` when asked.
    pub fn add_recipe_with(&mut self, recipe: impl Recipe, always_do: bool) -> &mut Self {
        let first = self.operations.len();
        recipe.add_to(self);
        if always_do {
            for operation in &mut self.operations[first..] {
                operation.always_do = true;
            }
        }
        self
    }

    /// Creates the output directories and runs every preprocess hook not yet run.
    pub fn preprocess(&mut self) -> ArborResult<()> {
        if self.preprocessed {
            return Ok(());
        }
        create_dir(&self.output_dir)?;

        let mut resolved = Vec::with_capacity(self.operations.len());
        for operation in &mut self.operations {
            if let Some(hook) = operation.preprocess.take() {
                debug!("Preprocessing for {}", operation.name);
                hook().map_err(|e| PipelineError::Preprocess {
                    operation: operation.name.clone(),
                    source: Box::new(e),
                })?;
            }
            let dir = match &operation.output_dir {
                Some(dir) => {
                    let dir = self.output_dir.join(dir);
                    create_dir(&dir)?;
                    Some(dir)
                }
                None => None,
            };
            resolved.push(dir);
        }
        self.resolved_dirs = resolved;
        self.preprocessed = true;
        Ok(())
    }

    /// Runs every operation on `target`. Returns whether the target passed every filter.
    pub fn process(&mut self, target: &mut AnalysisTarget) -> ArborResult<bool> {
        self.process_with_handoff(target, &[])
    }

    /// Like [`process`](Self::process), moving the attributes named in `handoff` from the previous target to this one and from this one to the next.
    pub fn process_with_handoff(&mut self, target: &mut AnalysisTarget, handoff: &[&str]) -> ArborResult<bool> {
        self.preprocess()?;

        for name in handoff {
            if let Some(value) = self.handoff.remove(*name) {
                target.insert_raw(name.to_string(), value);
            }
        }

        let mut passed = true;
        for (operation, dir) in self.operations.iter_mut().zip(&self.resolved_dirs) {
            if !passed && !operation.always_do {
                trace!("Skipping {} for {}", operation.name, target.node());
                continue;
            }
            let context = OperationContext { output_dir: dir.as_deref() };
            let result = (operation.function)(target, &context).map_err(|e| PipelineError::Operation {
                operation: operation.name.clone(),
                source: Box::new(e),
            })?;
            if let Some(keep) = result {
                passed &= keep;
            }
        }

        for name in handoff {
            if let Some(value) = target.remove_attr(name) {
                self.handoff.insert(name.to_string(), value);
            }
        }
        Ok(passed)
    }

    /// Convenience over [`process`](Self::process) for a bare node.
    pub fn process_node(&mut self, node: &Node) -> ArborResult<bool> {
        self.process(&mut AnalysisTarget::new(node.clone()))
    }

    /// Removes a stored handoff attribute, typically after the last target.
    pub fn take_handoff<T: Any>(&mut self, name: &str) -> Option<T> {
        let value = self.handoff.remove(name)?;
        value.downcast::<T>().ok().map(|value| *value)
    }
}

impl Default for AnalysisPipeline {
    fn default() -> Self {
        Self::new(".")
    }
}

impl fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("output_dir", &self.output_dir)
            .field("operations", &self.operations)
            .field("preprocessed", &self.preprocessed)
            .finish_non_exhaustive()
    }
}

fn create_dir(path: &Path) -> ArborResult<()> {
    fs::create_dir_all(path).map_err(|source| PipelineError::OutputDirectory { path: path.to_path_buf(), source })?;
    Ok(())
}
