//! Immutable, versioned snapshot of chunks and their vectors.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::IndexError;
use crate::models::{Chunk, EmbeddedChunk, SymbolKind};

/// A chunk returned by search with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

/// One published state of the index.
///
/// Chunks are sorted by id. Embedded chunks own one row of the
/// L2-normalized `matrix`; unembedded chunks own none and are never
/// returned by [`Generation::search`].
#[derive(Debug)]
pub struct Generation {
    pub(super) id: u64,
    created_at: DateTime<Utc>,
    dimensions: usize,
    chunks: Vec<Arc<Chunk>>,
    positions: HashMap<String, usize>,
    /// Row in `matrix` for each chunk position.
    rows: Vec<Option<usize>>,
    /// Chunk position for each matrix row.
    row_chunks: Vec<usize>,
    matrix: Vec<f32>,
    files: BTreeMap<String, String>,
}

impl Generation {
    /// Generation with no chunks, the state of a fresh index.
    pub(super) fn empty(dimensions: usize) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            dimensions,
            chunks: Vec::new(),
            positions: HashMap::new(),
            rows: Vec::new(),
            row_chunks: Vec::new(),
            matrix: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    /// Validate `entries` and lay them out for search. The id is assigned at publish time.
    pub(super) fn build(
        dimensions: usize,
        mut entries: Vec<EmbeddedChunk>,
        files: BTreeMap<String, String>,
    ) -> Result<Self, IndexError> {
        entries.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));

        let mut positions = HashMap::with_capacity(entries.len());
        for (pos, entry) in entries.iter().enumerate() {
            let chunk = &entry.chunk;
            if chunk.start_line == 0 || chunk.start_line > chunk.end_line {
                return Err(IndexError::InvalidSpan {
                    id: chunk.id.clone(),
                    start: chunk.start_line,
                    end: chunk.end_line,
                });
            }
            if positions.insert(chunk.id.clone(), pos).is_some() {
                return Err(IndexError::DuplicateId(chunk.id.clone()));
            }
        }

        for entry in &entries {
            let chunk = &entry.chunk;
            match (&chunk.parent_id, chunk.kind) {
                (None, SymbolKind::Module) => {}
                (None, _) => return Err(IndexError::OrphanChunk(chunk.id.clone())),
                (Some(parent_id), _) => {
                    let parent = positions
                        .get(parent_id)
                        .map(|&pos| &entries[pos].chunk)
                        .ok_or_else(|| IndexError::DanglingParent {
                            id: chunk.id.clone(),
                            parent: parent_id.clone(),
                        })?;
                    if !parent.contains_span(chunk) {
                        return Err(IndexError::OutsideParent {
                            id: chunk.id.clone(),
                            parent: parent_id.clone(),
                        });
                    }
                }
            }
        }

        let mut chunks = Vec::with_capacity(entries.len());
        let mut rows = Vec::with_capacity(entries.len());
        let mut row_chunks = Vec::new();
        let mut matrix = Vec::new();
        for (pos, entry) in entries.into_iter().enumerate() {
            match entry.vector {
                Some(vector) => {
                    if vector.len() != dimensions {
                        return Err(IndexError::DimensionMismatch {
                            expected: dimensions,
                            actual: vector.len(),
                        });
                    }
                    if vector.iter().any(|v| !v.is_finite()) {
                        return Err(IndexError::NonFiniteVector(entry.chunk.id));
                    }
                    rows.push(Some(row_chunks.len()));
                    row_chunks.push(pos);
                    matrix.extend(normalized(&vector));
                }
                None => rows.push(None),
            }
            chunks.push(Arc::new(entry.chunk));
        }

        Ok(Self {
            id: 0,
            created_at: Utc::now(),
            dimensions,
            chunks,
            positions,
            rows,
            row_chunks,
            matrix,
            files,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks that have a vector and are therefore searchable.
    pub fn embedded_len(&self) -> usize {
        self.row_chunks.len()
    }

    /// All chunks, sorted by id.
    pub fn chunks(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunks.iter()
    }

    /// Indexed files: relative path to content hash.
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Chunk>> {
        self.positions.get(id).map(|&pos| &self.chunks[pos])
    }

    /// The enclosing chunk of `chunk`, resolved within this generation.
    pub fn parent(&self, chunk: &Chunk) -> Option<&Arc<Chunk>> {
        chunk.parent_id.as_deref().and_then(|id| self.get(id))
    }

    /// Normalized vector of a chunk, `None` if unknown or unembedded.
    pub fn vector_of(&self, id: &str) -> Option<&[f32]> {
        let pos = *self.positions.get(id)?;
        let row = self.rows[pos]?;
        Some(self.row(row))
    }

    /// Chunks and vectors, for carrying entries into the next generation.
    pub fn entries(&self) -> impl Iterator<Item = (&Arc<Chunk>, Option<&[f32]>)> {
        self.chunks
            .iter()
            .zip(&self.rows)
            .map(|(chunk, row)| (chunk, row.map(|r| self.row(r))))
    }

    /// Exact k-nearest-neighbour search by cosine similarity.
    ///
    /// Results are sorted by descending score; equal scores are ordered by
    /// chunk id ascending.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if k == 0 || self.row_chunks.is_empty() {
            return Ok(Vec::new());
        }

        let query = normalized(query);
        let mut scored: Vec<(f32, usize)> = self
            .row_chunks
            .iter()
            .enumerate()
            .map(|(row, &pos)| (dot(&query, self.row(row)), pos))
            .collect();

        // positions follow id order, so ascending position is ascending id
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, pos)| SearchHit {
                chunk: Arc::clone(&self.chunks[pos]),
                score,
            })
            .collect())
    }

    fn row(&self, row: usize) -> &[f32] {
        let start = row * self.dimensions;
        &self.matrix[start..start + self.dimensions]
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Norms this close to 1 are treated as already normalized, so carrying a
/// vector into the next generation leaves it bit-identical.
const UNIT_TOLERANCE: f32 = 1e-4;

/// L2-normalize; a zero vector stays zero.
fn normalized(v: &[f32]) -> Vec<f32> {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 && (norm - 1.0).abs() > UNIT_TOLERANCE {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CodeMetadata, Signature};

    fn chunk(id: &str, kind: SymbolKind, span: (usize, usize), parent: Option<&str>) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_path: "app.py".to_string(),
            start_line: span.0,
            end_line: span.1,
            kind,
            qualified_name: format!("app.{id}"),
            docstring: None,
            signature: Signature::default(),
            metadata: CodeMetadata::default(),
            text: String::new(),
            truncated: false,
            parent_id: parent.map(str::to_string),
        }
    }

    fn entry(chunk: Chunk, vector: Option<Vec<f32>>) -> EmbeddedChunk {
        EmbeddedChunk { chunk, vector }
    }

    fn sample() -> Vec<EmbeddedChunk> {
        vec![
            entry(chunk("m", SymbolKind::Module, (1, 30), None), Some(vec![0.0, 0.0, 1.0])),
            entry(chunk("c", SymbolKind::Class, (1, 10), Some("m")), Some(vec![1.0, 0.0, 0.0])),
            entry(chunk("f", SymbolKind::Method, (2, 5), Some("c")), Some(vec![3.0, 4.0, 0.0])),
            entry(chunk("g", SymbolKind::Function, (12, 20), Some("m")), None),
        ]
    }

    #[test]
    fn test_build_sorts_and_indexes() {
        let generation = Generation::build(3, sample(), BTreeMap::new()).unwrap();
        let ids: Vec<&str> = generation.chunks().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "f", "g", "m"]);
        assert_eq!(generation.len(), 4);
        assert_eq!(generation.embedded_len(), 3);
        assert!(generation.vector_of("g").is_none());
        assert!(generation.get("g").is_some(), "unembedded chunks stay addressable");

        let f = generation.vector_of("f").unwrap();
        assert!((f[0] - 0.6).abs() < 1e-6 && (f[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_search_sorted_bounded_no_duplicates() {
        let generation = Generation::build(3, sample(), BTreeMap::new()).unwrap();
        let hits = generation.search(&[1.0, 0.5, 0.1], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
        assert_ne!(hits[0].chunk.id, hits[1].chunk.id);

        let all = generation.search(&[1.0, 0.5, 0.1], 10).unwrap();
        assert_eq!(all.len(), 3, "unembedded chunk never returned");
        assert!(all.iter().all(|h| h.chunk.id != "g"));
    }

    #[test]
    fn test_search_ties_by_id() {
        let entries = vec![
            entry(chunk("m", SymbolKind::Module, (1, 30), None), Some(vec![0.0, 1.0])),
            entry(chunk("b", SymbolKind::Function, (5, 6), Some("m")), Some(vec![1.0, 0.0])),
            entry(chunk("a", SymbolKind::Function, (1, 2), Some("m")), Some(vec![2.0, 0.0])),
        ];
        let generation = Generation::build(2, entries, BTreeMap::new()).unwrap();
        let hits = generation.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].chunk.id, "a");
        assert_eq!(hits[1].chunk.id, "b");
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let generation = Generation::build(3, sample(), BTreeMap::new()).unwrap();
        assert_eq!(
            generation.search(&[1.0, 0.0], 5).unwrap_err(),
            IndexError::DimensionMismatch { expected: 3, actual: 2 }
        );
        assert!(generation.search(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_build_rejects_invalid_generations() {
        let mut dup = sample();
        dup.push(entry(chunk("c", SymbolKind::Class, (1, 10), Some("m")), None));
        assert_eq!(
            Generation::build(3, dup, BTreeMap::new()).unwrap_err(),
            IndexError::DuplicateId("c".into())
        );

        let mut dangling = sample();
        dangling.push(entry(chunk("x", SymbolKind::Function, (21, 22), Some("nope")), None));
        assert!(matches!(
            Generation::build(3, dangling, BTreeMap::new()),
            Err(IndexError::DanglingParent { .. })
        ));

        let mut outside = sample();
        outside.push(entry(chunk("x", SymbolKind::Method, (8, 12), Some("c")), None));
        assert!(matches!(
            Generation::build(3, outside, BTreeMap::new()),
            Err(IndexError::OutsideParent { .. })
        ));

        let mut orphan = sample();
        orphan.push(entry(chunk("x", SymbolKind::Function, (21, 22), None), None));
        assert!(matches!(
            Generation::build(3, orphan, BTreeMap::new()),
            Err(IndexError::OrphanChunk(_))
        ));

        let mut bad_span = sample();
        bad_span.push(entry(chunk("x", SymbolKind::Function, (9, 3), Some("m")), None));
        assert!(matches!(
            Generation::build(3, bad_span, BTreeMap::new()),
            Err(IndexError::InvalidSpan { .. })
        ));

        let mut wrong_dim = sample();
        wrong_dim.push(entry(
            chunk("x", SymbolKind::Function, (21, 22), Some("m")),
            Some(vec![1.0]),
        ));
        assert!(matches!(
            Generation::build(3, wrong_dim, BTreeMap::new()),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn test_parent_lookup() {
        let generation = Generation::build(3, sample(), BTreeMap::new()).unwrap();
        let method = generation.get("f").unwrap();
        let class = generation.parent(method).unwrap();
        assert_eq!(class.id, "c");
        assert_eq!(generation.parent(class).unwrap().id, "m");
        assert!(generation.parent(generation.get("m").unwrap()).is_none());
    }
}
