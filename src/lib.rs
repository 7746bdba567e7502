//! `runsort` is a memory-budgeted external merge sort for keyed text records.
//!
//! The input is a set of plain-text files whose lines look like `42,alice,accountant`:
//! a signed 64-bit key followed by two text fields. Data sets far larger than RAM are
//! sorted in two stages. The ingestion stage streams the input files through a decoding
//! pipeline into an in-memory buffer and, every time the buffered bytes exceed a
//! configured budget, sorts the buffer in parallel and spills it to a chunk file. The
//! merge stage then repeatedly combines the sorted chunks, never holding more than a
//! fixed number of files open at once, until a single fully sorted output remains.
//! For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `runsort` supports the following features:
//!
//! * **Memory budget:**
//!   buffered records are measured by their actual heap footprint and flushed to disk
//!   whenever the budget is exceeded, so the resident set stays bounded regardless of
//!   input size.
//! * **Pipelined ingestion:**
//!   line reading, record decoding and buffer appending run on separate threads
//!   connected by bounded queues, keeping disk and CPU busy at the same time.
//! * **Multithreading support:**
//!   chunks are sorted on a dedicated thread pool with a duplicate-aware parallel
//!   quicksort that groups key-equal records around the pivot instead of recursing
//!   into them.
//! * **Bounded fan-in merge:**
//!   any number of chunk files is merged in passes of at most `fan_in` files each, so
//!   the open file count never grows with the data set.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use env_logger;
//! use log;
//!
//! use runsort::{discover_files, IngestStageBuilder, MemorySize, MergerBuilder};
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Info).init();
//!
//!     let inputs = discover_files(Path::new("./data"), |name| name.ends_with(".txt")).unwrap();
//!
//!     let stage = IngestStageBuilder::new()
//!         .with_memory_budget("500mb".parse::<MemorySize>().unwrap())
//!         .with_chunk_dir(Path::new("./chunks"))
//!         .build()
//!         .unwrap();
//!     let ingested = stage.run(&inputs).unwrap();
//!
//!     let merger = MergerBuilder::new().with_fan_in(9).build().unwrap();
//!     merger.merge(&ingested.runs, Path::new("./sorted.txt")).unwrap();
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod discover;
pub mod ingest;
pub mod merge;
pub mod quicksort;
pub mod record;

mod pipeline;

pub use buffer::{ChunkBuffer, SharedChunkBuffer};
pub use config::{ConfigError, MemorySize, OpenPolicy, ParseMemorySizeError};
pub use discover::discover_files;
pub use ingest::{IngestError, IngestReport, IngestStage, IngestStageBuilder};
pub use merge::{MergeError, MergeReport, Merger, MergerBuilder};
pub use quicksort::sort;
pub use record::{DecodeError, Record};
