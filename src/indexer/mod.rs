//! Project indexing: structure extraction, chunking and the coordinator
//! that embeds and commits generations.
pub mod chunker;
pub mod code_parser;
pub mod core;

pub use self::core::{IndexReport, IndexWarning, Indexer, IndexerError, WarningKind};
