//! Generation-versioned vector index.
//!
//! Readers take an `Arc` of the current [`Generation`] and search it without
//! holding any lock. [`VectorIndex::build`] validates and lays out a new
//! generation off-lock, then swaps the pointer in a single assignment.
mod generation;

pub use generation::{Generation, SearchHit};

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::models::EmbeddedChunk;

/// Violations of the generation invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("duplicate chunk id: {0}")]
    DuplicateId(String),

    #[error("chunk {id} has invalid span {start}..={end}")]
    InvalidSpan { id: String, start: usize, end: usize },

    #[error("chunk {0} has no parent")]
    OrphanChunk(String),

    #[error("chunk {id} references missing parent {parent}")]
    DanglingParent { id: String, parent: String },

    #[error("chunk {id} lies outside its parent {parent}")]
    OutsideParent { id: String, parent: String },

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk {0} has a non-finite vector component")]
    NonFiniteVector(String),
}

/// Holds the current generation and publishes new ones.
pub struct VectorIndex {
    dimensions: usize,
    current: RwLock<Arc<Generation>>,
}

impl VectorIndex {
    /// An index whose current generation (id 0) is empty.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            current: RwLock::new(Arc::new(Generation::empty(dimensions))),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// The generation queries currently read.
    pub fn current_generation(&self) -> Arc<Generation> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    /// Build a generation from `chunks` and make it current.
    ///
    /// Ids are assigned at swap time, so published ids strictly increase.
    /// On error the current generation is left untouched.
    pub fn build(
        &self,
        chunks: Vec<EmbeddedChunk>,
        files: BTreeMap<String, String>,
    ) -> Result<Arc<Generation>, IndexError> {
        let mut generation = Generation::build(self.dimensions, chunks, files)?;

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        generation.id = guard.id() + 1;
        let generation = Arc::new(generation);
        *guard = Arc::clone(&generation);
        drop(guard);

        debug!(
            "Published generation {} ({} chunks, {} embedded)",
            generation.id(),
            generation.len(),
            generation.embedded_len()
        );
        Ok(generation)
    }

    /// Search the current generation.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.current_generation().search(query, k)
    }
}
