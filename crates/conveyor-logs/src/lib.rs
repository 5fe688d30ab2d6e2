//! Append-only log pipeline for the Conveyor CI control plane.
//!
//! The writer chunks client log entries into blob-store objects keyed so
//! lexicographic order ascends by sequence-window end; the reader folds
//! overlapping chunks back into windows and merges descriptors into one
//! deterministic stream.

pub mod chunk;
pub mod reader;
pub mod service;
pub mod writer;

pub use chunk::{ChunkKey, Window, chunk_prefix, fold_windows};
pub use reader::{LogReader, ReadOptions};
pub use service::LogService;
pub use writer::{LogWriter, LogWriterConfig};
