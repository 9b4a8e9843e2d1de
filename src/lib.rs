//! `ext-line-sort` is an external sort of large line-oriented text files.
//!
//! The sorter handles text files far larger than RAM. The input is cut into chunks whose data and
//! line index fit a fixed memory budget, and the lines of each chunk are sorted in place and spilled to a
//! chunk file. The chunk files are then merged into the output by a merge tree whose branches run in
//! parallel. Peak memory depends on the configured budget only, never on the input size, and no line is
//! ever split between two chunks.
//!
//! # Overview
//!
//! `ext-line-sort` supports the following features:
//!
//! * **Zero-copy chunks:**
//!   lines are sorted in place as references into reusable fixed-size chunk buffers, no per-line allocations
//!   are made during the first pass.
//! * **Numeric prefix ordering:**
//!   lines of the form `<number>. <text>` are ordered by text first and then numerically by the number prefix,
//!   a custom comparator can be provided as well.
//! * **Multithreading support:**
//!   chunks are sorted in multiple threads, the merge pass runs independent merge branches in separate threads
//!   connected by bounded queues.
//! * **Memory limit support:**
//!   the chunk buffers size is derived from the available physical memory and an optional memory limit.
//!
//! # Example
//!
//! ```no_run
//! use std::path;
//!
//! use log;
//!
//! use ext_line_sort::TextFileSorterBuilder;
//!
//! fn main() {
//!     let sorter = TextFileSorterBuilder::new("input.txt", "output.txt")
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_memory_limit(50 * 1024 * 1024)
//!         .with_threads_number(4)
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter.sort().unwrap();
//!     log::info!("{} lines sorted", stats.lines);
//! }
//! ```

pub mod budget;
pub mod buffer;
pub mod chunk;
pub mod compare;
pub mod memory;
pub mod merger;
pub mod pool;
pub mod sort;

pub use buffer::{BufferLayout, ChunkReader, LineBuffer, LineRef};
pub use compare::{LineCompare, NumericPrefixComparator};
pub use memory::{MemoryHint, NoMemoryHint, ResidentSetHint};
pub use merger::{SortedStream, StreamMerger};
pub use sort::{SortError, SortStats, TextFileSorter, TextFileSorterBuilder};
