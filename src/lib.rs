//! # packforge
//!
//! Concurrent bulk I/O engine for packed game-resource archives.
//!
//! An archive is a flat list of [`Entry`] records pointing into one byte
//! stream. Every operation (extract, repack, compress staged files, hash,
//! classify) runs as a single pass over an index range of that list, split
//! into contiguous slices, one per worker thread. A coordinator throttles the
//! workers against CPU load and, for passes that write a new stream, merges
//! their private spool files in order and fixes up every entry's offset.
//!
//! ## Key Modules
//!
//! - [`engine`]: caller-facing entry points, one per pass kind.
//! - [`pool`]: the adaptive thread pool and the spool merge (`dump`).
//! - [`workers`]: per-pass worker behaviour behind the [`workers::EntryTask`] trait.
//! - [`planner`] and [`scan_cache`]: batched and forward-only reads of the source stream.
//! - [`codec`], [`crypto`] and [`pipeline`]: the per-entry decode/encode path.
//! - [`pack`]: a reference container format used by the CLI.
//!
//! ## Example
//!
//! ```no_run
//! use packforge::{pack, Engine, EngineConfig, FileSource};
//!
//! let path = std::path::Path::new("data.pkf");
//! let mut entries = pack::open_index(path)?;
//! let engine = Engine::new(FileSource::new(path), EngineConfig::default())?;
//! let len = entries.len();
//! let summary = engine.extract_range(&mut entries, 0..len, std::path::Path::new("out"))?;
//! println!("{} written, {} failed", summary.value, summary.recovered.len());
//! # Ok::<(), packforge::EngineError>(())
//! ```

pub mod autotune;
pub mod cli;
pub mod cli_runner;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod entry;
pub mod error;
pub mod gate;
pub mod pack;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod scan_cache;
pub mod source;
pub mod workers;

pub use config::EngineConfig;
pub use engine::{Engine, PassSummary};
pub use entry::Entry;
pub use error::EngineError;
pub use gate::CancelToken;
pub use pool::SpoolPass;
pub use progress::ProgressState;
pub use source::{FileSource, MemorySource, Source};
