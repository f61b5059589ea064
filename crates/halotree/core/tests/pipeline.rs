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

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use halotree_core::{AnalysisPipeline, AnalysisTarget, DataType, ExecutionContext, Operation, ParallelOptions, SaveEvery, parallel_trees};
use tempfile::TempDir;

type Log = Arc<Mutex<Vec<String>>>;

fn logged(log: &Log, name: &'static str, keep: Option<bool>) -> Operation {
    let log = log.clone();
    Operation::new(name, move |target: &mut AnalysisTarget, _| {
        log.lock().unwrap().push(format!("{name} {}", target.node().uid()));
        Ok(keep)
    })
}

#[test]
fn test_always_run_operations_after_a_rejection() {
    let temp_dir = TempDir::new().unwrap();
    let log: Log = Arc::default();
    let mut pipeline = AnalysisPipeline::new(temp_dir.path());
    pipeline
        .add_operation(logged(&log, "reject", Some(false)).always_do(true))
        .add_operation(logged(&log, "cleanup", None).always_do(true))
        .add_operation(logged(&log, "measure", None));

    let arbor = create_catalog_arbor();
    assert!(!pipeline.process_node(&arbor.root(0).unwrap()).unwrap());
    assert_eq!(*log.lock().unwrap(), vec!["reject 10", "cleanup 10"]);
}

#[test]
fn test_always_run_operation_after_a_filter() {
    let temp_dir = TempDir::new().unwrap();
    let log: Log = Arc::default();
    let mut pipeline = AnalysisPipeline::new(temp_dir.path());
    pipeline
        .add_operation(Operation::filter("heavy", |node| Ok(node.get_f64("mass")? > 10.0)))
        .add_operation(logged(&log, "measure", None))
        .add_operation(logged(&log, "cleanup", None).always_do(true));

    let arbor = create_catalog_arbor();
    for root in arbor.roots(0..3).unwrap() {
        pipeline.process_node(&root).unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec!["measure 10", "cleanup 10", "cleanup 20", "measure 30", "cleanup 30"]);
}

#[test]
fn test_pipelines_per_worker() {
    let temp_dir = TempDir::new().unwrap();
    let arbor = create_catalog_arbor();
    arbor.add_analysis_field("heavy_progenitors", "", 0.0, DataType::Int).unwrap();
    let trees = arbor.roots(0..3).unwrap();
    let output = temp_dir.path().to_path_buf();

    let build = |_worker: usize| {
        let mut pipeline = AnalysisPipeline::new(output.clone());
        pipeline
            .add_operation(Operation::filter("has_progenitors", |node| Ok(!node.ancestors()?.is_empty())))
            .add_operation(Operation::action("count", |target: &mut AnalysisTarget| {
                let mut heavy = 0i64;
                for node in target.node().prog()? {
                    if node?.get_f64("mass")? > 6.0 {
                        heavy += 1;
                    }
                }
                target.node().set("heavy_progenitors", heavy)
            }));
        pipeline
    };

    let options = ParallelOptions::new().save_every(SaveEvery::Never);
    let outcome = parallel_trees(&trees, &ExecutionContext::new().workers(2), &options, build, |pipeline, tree| pipeline.process_node(tree)).unwrap();
    assert_eq!(outcome.results, vec![true, false, true]);

    let counts: Vec<i64> = trees.iter().map(|tree| tree.get("heavy_progenitors").unwrap().value.as_i64().unwrap()).collect();
    assert_eq!(counts, vec![2, 0, 2]);
}
