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

//! Forest link construction and traversal benchmarks

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use halotree_core::graph::ForestLinks;
use halotree_core::{Arbor, FieldValues, MemoryBackend};

/// A binary merger tree of `size` halos stored in breadth-first order.
fn binary_forest(size: usize) -> (Vec<i64>, Vec<i64>) {
    let uids: Vec<i64> = (0..size as i64).collect();
    let desc_uids = uids.iter().map(|uid| if *uid == 0 { -1 } else { (uid - 1) / 2 }).collect();
    (uids, desc_uids)
}

fn bench_links(c: &mut Criterion) {
    let mut group = c.benchmark_group("forest_links");
    for size in [1_000usize, 10_000, 100_000] {
        let (uids, desc_uids) = binary_forest(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("build", size), &size, |b, _| {
            b.iter(|| ForestLinks::build(0, black_box(uids.clone()), black_box(desc_uids.clone())).unwrap())
        });

        let links = ForestLinks::build(0, uids.clone(), desc_uids.clone()).unwrap();
        group.bench_with_input(BenchmarkId::new("tree_rows", size), &size, |b, _| b.iter(|| links.tree_rows(black_box(0))));
    }
    group.finish();
}

fn bench_progenitor_line(c: &mut Criterion) {
    let size = 10_000;
    let (uids, desc_uids) = binary_forest(size);
    let masses: Vec<f64> = (0..size).map(|i| (size - i) as f64).collect();
    let backend = MemoryBackend::builder("bench")
        .column("uid", FieldValues::Int(uids), "")
        .column("desc_uid", FieldValues::Int(desc_uids), "")
        .column("mass", FieldValues::Float(masses), "Msun")
        .build()
        .unwrap();
    let arbor = Arbor::new(backend).unwrap();
    let root = arbor.root(0).unwrap();
    root.preload(&["mass".to_string()]).unwrap();

    c.bench_function("prog_mass", |b| b.iter(|| root.selection_field(black_box(halotree_core::Selection::Prog), "mass").unwrap()));
}

criterion_group!(forest_benches, bench_links, bench_progenitor_line);
criterion_main!(forest_benches);
