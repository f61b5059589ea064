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

//! halotree CLI
//!
//! Inspect, query and convert merger-tree catalogs from the command line.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use halotree_common::HaloTreeConfig;
use halotree_core::traversal::Comparison;
use halotree_core::{Arbor, ArborResult, DataFormat, FieldValue, LoadOptions, Node, Predicate, SaveOptions, Selection, load};
use serde_json::{Value, json};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, checked before `RUST_LOG`.
const LOG_ENV: &str = "HALOTREE_LOG";

#[derive(Parser)]
#[command(name = "halotree")]
#[command(about = "Merger-tree catalog tool")]
#[command(version)]
struct Cli {
    /// Path to configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Input format, guessed from the path when omitted
    #[arg(long, value_enum, global = true)]
    format: Option<FormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Canonical,
    Csv,
}

#[derive(Clone, Copy, ValueEnum)]
enum SelectionArg {
    Tree,
    Forest,
    Prog,
}

impl From<SelectionArg> for Selection {
    fn from(selection: SelectionArg) -> Self {
        match selection {
            SelectionArg::Tree => Selection::Tree,
            SelectionArg::Forest => Selection::Forest,
            SelectionArg::Prog => Selection::Prog,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OpArg {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl From<OpArg> for Comparison {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Gt => Comparison::Gt,
            OpArg::Ge => Comparison::Ge,
            OpArg::Lt => Comparison::Lt,
            OpArg::Le => Comparison::Le,
            OpArg::Eq => Comparison::Eq,
            OpArg::Ne => Comparison::Ne,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a catalog
    Info {
        /// Catalog path
        path: PathBuf,
    },
    /// List the fields of a catalog
    Fields {
        /// Catalog path
        path: PathBuf,
    },
    /// Save a catalog (or some of its trees) as a canonical container
    Save {
        /// Catalog path
        path: PathBuf,
        /// Output directory
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Fields to save, all by default
        #[arg(long, value_delimiter = ',')]
        fields: Option<Vec<String>>,
        /// Indices of the trees to save, all by default
        #[arg(long, value_delimiter = ',')]
        trees: Option<Vec<usize>>,
        /// Nodes per shard
        #[arg(long)]
        max_file_size: Option<usize>,
    },
    /// Print the halos whose field satisfies a comparison
    Select {
        /// Catalog path
        path: PathBuf,
        /// Field to compare
        #[arg(long)]
        field: String,
        #[arg(long, value_enum, default_value = "gt")]
        op: OpArg,
        /// Value to compare against
        #[arg(long)]
        value: f64,
        /// Units of the value, the field's own units by default
        #[arg(long)]
        units: Option<String>,
        #[arg(long, value_enum, default_value = "forest")]
        selection: SelectionArg,
        /// Extra fields to print for each match
        #[arg(long, value_delimiter = ',')]
        show: Vec<String>,
    },
    /// Print a field along the progenitor line of a tree
    Prog {
        /// Catalog path
        path: PathBuf,
        /// Index of the tree
        #[arg(long, default_value_t = 0)]
        tree: usize,
        /// Field to print
        #[arg(long, default_value = "mass")]
        field: String,
    },
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() {
    let cli = Cli::parse();

    let config = HaloTreeConfig::resolve_config(cli.config.clone());
    init_tracing(config.as_ref().map_or("info", |config| config.log_level.as_str()));
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let mut options = LoadOptions::new().config(config);
    if let Some(format) = cli.format {
        options = options.format(match format {
            FormatArg::Canonical => DataFormat::Canonical,
            FormatArg::Csv => DataFormat::Csv,
        });
    }

    let result = match cli.command {
        Commands::Info { path } => open(&path, options).and_then(|arbor| handle_info(&arbor)),
        Commands::Fields { path } => open(&path, options).and_then(|arbor| handle_fields(&arbor)),
        Commands::Save {
            path,
            output,
            fields,
            trees,
            max_file_size,
        } => open(&path, options).and_then(|arbor| handle_save(&arbor, output, fields, trees, max_file_size)),
        Commands::Select {
            path,
            field,
            op,
            value,
            units,
            selection,
            show,
        } => open(&path, options).and_then(|arbor| handle_select(&arbor, &field, op.into(), value, units, selection.into(), &show)),
        Commands::Prog { path, tree, field } => open(&path, options).and_then(|arbor| handle_prog(&arbor, tree, &field)),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

fn open(path: &Path, options: LoadOptions) -> Result<Arc<Arbor>> {
    load(path, options).with_context(|| format!("Failed to open {}", path.display()))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_info(arbor: &Arc<Arbor>) -> Result<()> {
    let size = arbor.size()?;
    let reassigned = arbor.reassignments()?.len();
    print_json(&json!({
        "name": arbor.name(),
        "format": arbor.backend().format(),
        "canonical": arbor.is_canonical(),
        "trees": size,
        "reassigned_descendants": reassigned,
        "selector": arbor.selector().name(),
        "metadata": serde_json::to_value(arbor.metadata())?,
    }))
}

fn handle_fields(arbor: &Arc<Arbor>) -> Result<()> {
    let fields: Vec<Value> = arbor
        .field_list()
        .into_iter()
        .filter_map(|name| arbor.field_info(&name))
        .map(|info| {
            json!({
                "name": info.name,
                "kind": info.kind.name(),
                "units": info.units_str(),
                "dtype": info.dtype.to_string(),
                "description": info.description,
            })
        })
        .collect();
    print_json(&Value::Array(fields))
}

fn handle_save(arbor: &Arc<Arbor>, output: PathBuf, fields: Option<Vec<String>>, trees: Option<Vec<usize>>, max_file_size: Option<usize>) -> Result<()> {
    let mut options = SaveOptions::new().filename(&output).in_place(false);
    if let Some(fields) = fields {
        options = options.fields(fields);
    }
    if let Some(indices) = trees {
        let size = arbor.size()?;
        if let Some(bad) = indices.iter().find(|index| **index >= size) {
            bail!("Tree {} is out of range, the catalog has {} trees", bad, size);
        }
        options = options.trees(indices.into_iter().map(|index| arbor.root(index)).collect::<ArborResult<Vec<Node>>>()?);
    }
    if let Some(max_file_size) = max_file_size {
        options = options.max_file_size(max_file_size);
    }

    match arbor.save(options)? {
        Some(header) => {
            println!("{}", header.display());
            info!("Saved {} to {}", arbor.name(), header.display());
        }
        None => println!("Nothing to save"),
    }
    Ok(())
}

fn describe(node: &Node, fields: &[String]) -> Result<Value> {
    let mut entry = serde_json::Map::new();
    entry.insert("uid".to_string(), json!(node.uid()));
    entry.insert("tree".to_string(), json!(node.arbor_index()));
    for field in fields {
        let value = match node.get(field)?.value {
            FieldValue::Float(value) => json!(value),
            FieldValue::Int(value) => json!(value),
            FieldValue::Vector(values) => json!(values),
        };
        entry.insert(field.clone(), value);
    }
    Ok(Value::Object(entry))
}

fn handle_select(arbor: &Arc<Arbor>, field: &str, op: Comparison, value: f64, units: Option<String>, selection: Selection, show: &[String]) -> Result<()> {
    let mut reference = Predicate::field(field);
    if let Some(units) = units {
        reference = reference.in_units(units);
    }
    let predicate = reference.compare(op, value);
    info!("Selecting {} halos where {} {} {}", selection, field, op, value);

    let mut printed: Vec<String> = vec![field.to_string()];
    printed.extend(show.iter().cloned());
    let preload: Vec<&str> = show.iter().map(String::as_str).collect();

    let mut count = 0;
    for node in arbor.select_halos(predicate, selection, &preload)? {
        println!("{}", serde_json::to_string(&describe(&node?, &printed)?)?);
        count += 1;
    }
    info!("{} halos matched", count);
    Ok(())
}

fn handle_prog(arbor: &Arc<Arbor>, tree: usize, field: &str) -> Result<()> {
    let size = arbor.size()?;
    if tree >= size {
        bail!("Tree {} is out of range, the catalog has {} trees", tree, size);
    }
    let root = arbor.root(tree)?;
    let values = root.selection_field(Selection::Prog, field)?;
    let uids: Vec<i64> = root.prog()?.map(|node| node.map(|node| node.uid())).collect::<ArborResult<_>>()?;
    print_json(&json!({
        "tree": tree,
        "uids": uids,
        "field": field,
        "units": values.units.expr(),
        "values": values.as_f64_vec(),
    }))
}
