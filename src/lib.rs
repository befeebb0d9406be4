//! # coderag — Code Indexing and Retrieval Engine
//!
//! Parses Python projects into addressable code chunks, embeds them, and
//! serves similarity-ranked context for natural-language questions.
//!
//! ## Architecture
//!
//! - **[`config`]** — Configuration loading, validation, and defaults
//! - **[`models`]** — Chunk records shared across the pipeline
//! - **[`indexer`]** — Tree-sitter structure extraction, chunking, and the project indexer
//! - **[`embedder`]** — Embedder trait, HTTP and hashing adapters, retry policy
//! - **[`index`]** — Generation-versioned vector index with exact cosine search
//! - **[`retriever`]** — Thresholded, deduplicated top-k retrieval
//! - **[`db`]** — SQLite snapshot persistence keyed by file-set hash

pub mod config;
pub mod db;
pub mod embedder;
pub mod index;
pub mod indexer;
pub mod models;
pub mod retriever;
