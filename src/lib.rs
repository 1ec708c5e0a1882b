//! Streaming parser and graph analysis engine for V8 heap snapshots.
//!
//! This crate ingests the `.heapsnapshot` JSON format produced by Chrome
//! DevTools and V8's heap profiler, parses it incrementally without
//! materializing a JSON DOM for the bulk arrays, and builds the derived
//! indexes needed for memory analysis: retainers, shortest distances from
//! the GC roots, a dominator tree, retained sizes, per-class aggregates
//! and snapshot-to-snapshot diffs.
//!
//! # Modules
//!
//! - [`tokenizer`] - Balanced-brace JSON tokenizer for chunked input
//! - [`loader`] - [`SnapshotLoader`](loader::SnapshotLoader) streaming parser
//! - [`snapshot`] - [`HeapSnapshot`](snapshot::HeapSnapshot) graph engine
//! - [`cursor`] - Zero-allocation node/edge cursor views
//! - [`providers`] - Paginated, sortable node/edge providers
//! - [`allocation`] - Allocation profile (top-down and bottom-up call trees)
//!
//! # Example
//!
//! ```no_run
//! use heapsnap::loader::SnapshotLoader;
//! use std::fs::File;
//! use std::io::{BufReader, Read};
//!
//! let mut reader = BufReader::new(File::open("before.heapsnapshot").unwrap());
//! let mut loader = SnapshotLoader::new();
//! let mut chunk = vec![0u8; 1 << 20];
//! loop {
//!     let n = reader.read(&mut chunk).unwrap();
//!     if n == 0 {
//!         break;
//!     }
//!     loader.write(std::str::from_utf8(&chunk[..n]).unwrap()).unwrap();
//! }
//! loader.close().unwrap();
//! let snapshot = loader.build_snapshot().unwrap();
//! println!("{} nodes", snapshot.node_count());
//! ```

pub mod allocation;
pub mod cursor;
pub mod loader;
pub mod providers;
pub mod snapshot;
pub mod tokenizer;

pub use loader::{NullProgress, Progress, SnapshotLoader};
pub use snapshot::{HeapSnapshot, Result, SnapshotError};
