//! Inspect Chrome heap snapshots from the command line.
//!
//! # Usage
//!
//! ```bash
//! heapsnap summary app.heapsnapshot
//! heapsnap classes app.heapsnapshot -n 20
//! heapsnap diff baseline.heapsnapshot target.heapsnapshot -o diff.ndjson
//! ```

use clap::{Parser, Subcommand};
use heapsnap::{HeapSnapshot, Progress, SnapshotLoader};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "heapsnap")]
#[command(about = "Inspect Chrome heap snapshots")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print node/edge counts and the per-category size statistics
    Summary {
        /// Heap snapshot file (.heapsnapshot)
        snapshot: PathBuf,
    },

    /// Print the largest object classes by retained size
    Classes {
        /// Heap snapshot file (.heapsnapshot)
        snapshot: PathBuf,

        /// Maximum number of classes to print
        #[arg(short = 'n', long, default_value = "25")]
        limit: usize,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare two snapshots and report per-class growth
    Diff {
        /// Baseline heap snapshot (before the leak)
        baseline: PathBuf,

        /// Target heap snapshot (after the leak)
        target: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Forwards loader status lines to stderr.
struct ConsoleProgress;

impl Progress for ConsoleProgress {
    fn update_status(&mut self, status: &str) {
        eprintln!("  {status}");
    }

    fn report_problem(&mut self, error: &str) {
        eprintln!("Warning: {error}");
    }
}

fn load_snapshot(path: &Path) -> Result<HeapSnapshot, Box<dyn std::error::Error>> {
    eprintln!("Loading {}", path.display());
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    let mut loader = SnapshotLoader::with_progress(Box::new(ConsoleProgress));
    loader.write(&text)?;
    loader.close()?;
    let snapshot = loader.build_snapshot()?;
    eprintln!(
        "  {} nodes, {} edges",
        snapshot.node_count(),
        snapshot.edge_count()
    );
    Ok(snapshot)
}

fn writer_for(output: Option<&Path>) -> Result<Box<dyn Write>, std::io::Error> {
    Ok(match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout()),
    })
}

fn write_ndjson<T: Serialize>(
    writer: &mut dyn Write,
    rows: impl IntoIterator<Item = T>,
) -> Result<(), Box<dyn std::error::Error>> {
    for row in rows {
        serde_json::to_writer(&mut *writer, &row)?;
        writeln!(writer)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct ClassRow<'a> {
    name: &'a str,
    count: u32,
    self_size: u64,
    retained_size: f64,
    distance: i32,
}

#[derive(Serialize)]
struct DiffRow<'a> {
    name: &'a str,
    added_count: u32,
    removed_count: u32,
    count_delta: i64,
    added_size: u64,
    removed_size: u64,
    size_delta: i64,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::Summary { snapshot } => {
            let snapshot = load_snapshot(&snapshot)?;
            let statistics = snapshot.statistics();
            println!("nodes:          {}", snapshot.node_count());
            println!("edges:          {}", snapshot.edge_count());
            println!("total size:     {} bytes", statistics.total);
            println!("  JS heap:      {} bytes", statistics.v8_heap);
            println!("  native:       {} bytes", statistics.native);
            println!("  code:         {} bytes", statistics.code);
            println!("  strings:      {} bytes", statistics.strings);
            println!("  JS arrays:    {} bytes", statistics.js_arrays);
            println!("  system:       {} bytes", statistics.system);
        }

        Command::Classes {
            snapshot,
            limit,
            output,
        } => {
            let snapshot = load_snapshot(&snapshot)?;
            let aggregates = snapshot.aggregates(false, "allObjects", None);
            let mut classes: Vec<(&String, &heapsnap::snapshot::Aggregate)> =
                aggregates.iter().collect();
            classes.sort_by(|a, b| {
                b.1.max_ret
                    .partial_cmp(&a.1.max_ret)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let mut writer = writer_for(output.as_deref())?;
            write_ndjson(
                writer.as_mut(),
                classes.iter().take(limit).map(|(name, aggregate)| ClassRow {
                    name: name.as_str(),
                    count: aggregate.count,
                    self_size: aggregate.self_size,
                    retained_size: aggregate.max_ret,
                    distance: aggregate.distance,
                }),
            )?;
        }

        Command::Diff {
            baseline,
            target,
            output,
        } => {
            let baseline = load_snapshot(&baseline)?;
            let target = load_snapshot(&target)?;
            eprintln!("Computing diff...");
            let base_aggregates = baseline.aggregates_for_diff();
            let diff = target.calculate_snapshot_diff(baseline.max_node_id(), &base_aggregates);
            let mut rows: Vec<(&String, &heapsnap::snapshot::Diff)> = diff.iter().collect();
            rows.sort_by_key(|(_, diff)| -diff.size_delta);
            eprintln!("{} classes changed", rows.len());
            let mut writer = writer_for(output.as_deref())?;
            write_ndjson(
                writer.as_mut(),
                rows.iter().map(|(name, diff)| DiffRow {
                    name: name.as_str(),
                    added_count: diff.added_count,
                    removed_count: diff.removed_count,
                    count_delta: diff.count_delta,
                    added_size: diff.added_size,
                    removed_size: diff.removed_size,
                    size_delta: diff.size_delta,
                }),
            )?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
