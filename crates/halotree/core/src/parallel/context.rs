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

//! Explicit description of how work is spread over threads

use halotree_common::HaloTreeConfig;

use crate::error::{ArborResult, ParallelError};

/// How items are handed to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// Even contiguous split, decided up front.
    #[default]
    Static,
    /// Workers take the next item from a shared queue as they finish.
    Dynamic,
}

/// Worker layout for the parallel iteration strategies
///
/// `groups` splits the workers for two-level strategies: the outer level runs
/// `groups` workers over trees and each of those gets `workers / groups`
/// threads for the nodes of its tree. A `groups` of 0 gives every worker its
/// own tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub workers: usize,
    pub groups: usize,
    pub distribution: Distribution,
    pub inner_distribution: Distribution,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            groups: 0,
            distribution: Distribution::Static,
            inner_distribution: Distribution::Static,
        }
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the configured worker count, falling back to every available core.
    pub fn from_config(config: &HaloTreeConfig) -> Self {
        let mut context = Self::default();
        if let Some(workers) = config.workers {
            context.workers = workers;
        }
        context
    }

    /// A single worker.
    pub fn serial() -> Self {
        Self::default().workers(1)
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn inner_distribution(mut self, distribution: Distribution) -> Self {
        self.inner_distribution = distribution;
        self
    }

    pub fn validate(&self) -> ArborResult<()> {
        if self.workers == 0 {
            return Err(ParallelError::InvalidContext("at least one worker is required".to_string()).into());
        }
        if self.groups > self.workers {
            return Err(ParallelError::InvalidContext(format!("{} groups cannot be formed from {} workers", self.groups, self.workers)).into());
        }
        Ok(())
    }

    /// Workers at the outer (tree) level.
    pub fn outer_workers(&self) -> usize {
        if self.groups == 0 { self.workers } else { self.groups }
    }

    /// Workers available inside each outer worker.
    pub fn inner_workers(&self) -> usize {
        (self.workers / self.outer_workers().max(1)).max(1)
    }

    /// Context for the nodes of one tree inside an outer worker.
    pub fn inner(&self) -> ExecutionContext {
        ExecutionContext {
            workers: self.inner_workers(),
            groups: 0,
            distribution: self.inner_distribution,
            inner_distribution: self.inner_distribution,
        }
    }
}
