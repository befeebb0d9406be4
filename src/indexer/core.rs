use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{SnapshotStore, StoreError, snapshot_key};
use crate::embedder::Embedder;
use crate::embedder::retry::{RetryPolicy, embed_with_retry};
use crate::index::{Generation, IndexError, VectorIndex};
use crate::indexer::chunker::{ChunkerConfig, build_chunks};
use crate::indexer::code_parser::{CodeParser, module_name_for};
use crate::models::EmbeddedChunk;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("project root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("path {} is not inside project root {}", .path.display(), .root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("invalid exclude pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("embedder produces {embedder} dimensions but the index holds {index}")]
    DimensionMismatch { embedder: usize, index: usize },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("indexing task failed: {0}")]
    Task(String),

    #[error("indexing cancelled")]
    Cancelled,
}

/// What a warning is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningKind {
    Read,
    Parse,
    Embedding,
    Snapshot,
}

/// A non-fatal problem met while indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexWarning {
    pub path: String,
    pub kind: WarningKind,
    pub message: String,
}

/// Outcome of an indexing operation.
///
/// `chunks_indexed` and `chunks_unembedded` describe the published
/// generation; the other counters describe the operation itself.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub generation_id: u64,
    pub warnings: Vec<IndexWarning>,
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub chunks_indexed: usize,
    pub chunks_unembedded: usize,
    pub chunks_reused: usize,
    pub reused_snapshot: bool,
    pub duration_ms: u64,
}

impl IndexReport {
    fn warn(&mut self, path: &str, kind: WarningKind, message: String) {
        self.warnings.push(IndexWarning {
            path: path.to_string(),
            kind,
            message,
        });
    }
}

/// A discovered source file, read and hashed.
struct SourceFile {
    rel_path: String,
    source: String,
    hash: String,
}

/// Everything a per-file task needs, shared across tasks.
struct FileContext {
    parser: CodeParser,
    embedder: Arc<dyn Embedder>,
    chunker: ChunkerConfig,
    retry: RetryPolicy,
}

#[derive(Default)]
struct FileOutcome {
    rel_path: String,
    chunks: Vec<EmbeddedChunk>,
    warnings: Vec<IndexWarning>,
    parsed: bool,
    reused: usize,
}

/// Coordinates discovery, extraction, chunking, embedding and commit.
pub struct Indexer {
    ctx: Arc<FileContext>,
    index: Arc<VectorIndex>,
    store: Option<Arc<TokioMutex<SnapshotStore>>>,
    extensions: Vec<String>,
    excludes: GlobSet,
    max_workers: usize,
    keep_snapshots: usize,
    commit_lock: TokioMutex<()>,
}

impl Indexer {
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
    ) -> Result<Self, IndexerError> {
        if embedder.dimensions() != index.dimensions() {
            return Err(IndexerError::DimensionMismatch {
                embedder: embedder.dimensions(),
                index: index.dimensions(),
            });
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.indexing.exclude {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            ctx: Arc::new(FileContext {
                parser: CodeParser::new(),
                embedder,
                chunker: config.chunker(),
                retry: config.retry_policy(),
            }),
            index,
            store: None,
            extensions: config.indexing.extensions.clone(),
            excludes: builder.build()?,
            max_workers: config.indexing.max_workers.max(1),
            keep_snapshots: config.keep_snapshots,
            commit_lock: TokioMutex::new(()),
        })
    }

    /// Persist generations to `store` and reuse them for unchanged file sets.
    #[must_use]
    pub fn with_store(mut self, store: Arc<TokioMutex<SnapshotStore>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Index every eligible file under `root` and publish one generation.
    pub async fn index_project(&self, root: &Path) -> Result<IndexReport, IndexerError> {
        self.index_project_with_cancel(root, CancellationToken::new())
            .await
    }

    /// Like [`Indexer::index_project`], but stops without publishing when
    /// `cancel` fires.
    pub async fn index_project_with_cancel(
        &self,
        root: &Path,
        cancel: CancellationToken,
    ) -> Result<IndexReport, IndexerError> {
        let started = Instant::now();
        if !root.is_dir() {
            return Err(IndexerError::NotADirectory(root.to_path_buf()));
        }
        info!("Indexing project {}", root.display());

        let mut report = IndexReport::default();
        let paths = self.discover(root);
        report.files_scanned = paths.len();

        let mut sources = Vec::with_capacity(paths.len());
        for rel_path in paths {
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            match read_source(root, &rel_path).await {
                Ok(file) => sources.push(file),
                Err(message) => {
                    warn!("Skipping {rel_path}: {message}");
                    report.warn(&rel_path, WarningKind::Read, message);
                }
            }
        }

        let files: BTreeMap<String, String> = sources
            .iter()
            .map(|f| (f.rel_path.clone(), f.hash.clone()))
            .collect();
        let key = snapshot_key(&self.profile(), &files);

        if let Some(snapshot) = self.load_snapshot(&key, &mut report).await {
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            let chunk_count = snapshot.chunks.len();
            let chunked: HashSet<String> = snapshot
                .chunks
                .iter()
                .map(|c| c.chunk.file_path.clone())
                .collect();
            let built = {
                let _guard = self.commit_lock.lock().await;
                self.index.build(snapshot.chunks, snapshot.files)
            };
            match built {
                Ok(generation) => {
                    report.chunks_reused = chunk_count;
                    report.files_indexed = chunked.len();
                    report.reused_snapshot = true;
                    self.replay_parse_warnings(&sources, &chunked, &mut report);
                    finish(&mut report, &generation, started);
                    info!(
                        "Reused snapshot for {} files as generation {}",
                        report.files_indexed, report.generation_id
                    );
                    return Ok(report);
                }
                Err(e) => {
                    warn!("Discarding snapshot that violates index invariants: {e}");
                    report.warn("", WarningKind::Snapshot, e.to_string());
                    self.discard_snapshot(&key).await;
                }
            }
        }

        let previous = self.index.current_generation();
        let outcomes = self.process_files(sources, &previous, &cancel).await?;

        let mut chunks = Vec::new();
        for outcome in outcomes {
            if outcome.parsed {
                report.files_indexed += 1;
            }
            report.chunks_reused += outcome.reused;
            report.warnings.extend(outcome.warnings);
            chunks.extend(outcome.chunks);
        }

        let generation = {
            let _guard = self.commit_lock.lock().await;
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            self.index.build(chunks, files)?
        };
        finish(&mut report, &generation, started);
        self.save_snapshot(&key, &generation, &mut report).await;

        info!(
            "Indexed {}/{} files into generation {} ({} chunks, {} unembedded, {} warnings)",
            report.files_indexed,
            report.files_scanned,
            report.generation_id,
            report.chunks_indexed,
            report.chunks_unembedded,
            report.warnings.len()
        );
        Ok(report)
    }

    /// Re-index one file and publish a generation in which only its chunks changed.
    ///
    /// A file that no longer exists, or is no longer eligible, is dropped.
    pub async fn reindex_file(
        &self,
        root: &Path,
        path: &Path,
    ) -> Result<IndexReport, IndexerError> {
        self.replace_file(root, path, true).await
    }

    /// Drop one file's chunks and publish the resulting generation.
    pub async fn remove_file(&self, root: &Path, path: &Path) -> Result<IndexReport, IndexerError> {
        self.replace_file(root, path, false).await
    }

    async fn replace_file(
        &self,
        root: &Path,
        path: &Path,
        reread: bool,
    ) -> Result<IndexReport, IndexerError> {
        let started = Instant::now();
        let rel_path = relative_path(root, path)?;
        let mut report = IndexReport::default();

        // held across read-modify-publish so concurrent single-file updates are not lost
        let _guard = self.commit_lock.lock().await;
        let previous = self.index.current_generation();

        let mut chunks: Vec<EmbeddedChunk> = previous
            .entries()
            .filter(|(chunk, _)| chunk.file_path != rel_path)
            .map(|(chunk, vector)| EmbeddedChunk {
                chunk: chunk.as_ref().clone(),
                vector: vector.map(<[f32]>::to_vec),
            })
            .collect();
        let mut files = previous.files().clone();
        files.remove(&rel_path);

        if reread && root.join(&rel_path).is_file() && self.is_eligible(&rel_path) {
            report.files_scanned = 1;
            match read_source(root, &rel_path).await {
                Ok(file) => {
                    files.insert(file.rel_path.clone(), file.hash.clone());
                    let outcome =
                        process_file(Arc::clone(&self.ctx), file, Arc::clone(&previous)).await;
                    if outcome.parsed {
                        report.files_indexed = 1;
                    }
                    report.chunks_reused = outcome.reused;
                    report.warnings.extend(outcome.warnings);
                    chunks.extend(outcome.chunks);
                }
                Err(message) => {
                    warn!("Skipping {rel_path}: {message}");
                    report.warn(&rel_path, WarningKind::Read, message);
                }
            }
        } else {
            debug!("Dropping {rel_path} from the index");
        }

        let generation = self.index.build(chunks, files)?;
        finish(&mut report, &generation, started);

        let key = snapshot_key(&self.profile(), generation.files());
        self.save_snapshot(&key, &generation, &mut report).await;
        Ok(report)
    }

    /// Project-relative paths of eligible files, sorted.
    fn discover(&self, root: &Path) -> Vec<String> {
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .require_git(false)
            .build();

        let mut paths = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            // Replace backslashes with forward slashes for cross-platform consistency.
            let rel_path = rel.to_string_lossy().replace('\\', "/");
            if self.is_eligible(&rel_path) {
                paths.push(rel_path);
            }
        }
        paths.sort();
        debug!("Discovered {} files under {}", paths.len(), root.display());
        paths
    }

    fn is_eligible(&self, rel_path: &str) -> bool {
        let ext = Path::new(rel_path)
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        self.extensions.iter().any(|e| e == ext) && !self.excludes.is_match(rel_path)
    }

    /// Everything besides file content that shapes chunks and vectors.
    fn profile(&self) -> String {
        format!(
            "{}:{}:{}",
            self.ctx.embedder.name(),
            self.ctx.embedder.dimensions(),
            self.ctx.chunker.max_chunk_chars
        )
    }

    /// Run the per-file pipeline on a bounded pool of tasks.
    async fn process_files(
        &self,
        sources: Vec<SourceFile>,
        previous: &Arc<Generation>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileOutcome>, IndexerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut set = JoinSet::new();
        for file in sources {
            let ctx = Arc::clone(&self.ctx);
            let previous = Arc::clone(previous);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                process_file(ctx, file, previous).await
            });
        }

        let mut outcomes = Vec::new();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    set.abort_all();
                    warn!("Indexing cancelled, discarding {} finished files", outcomes.len());
                    return Err(IndexerError::Cancelled);
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => {
                        set.abort_all();
                        return Err(IndexerError::Task(e.to_string()));
                    }
                },
            }
        }

        // completion order is arbitrary
        outcomes.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(outcomes)
    }

    async fn load_snapshot(
        &self,
        key: &str,
        report: &mut IndexReport,
    ) -> Option<crate::db::Snapshot> {
        let store = self.store.as_ref()?;
        let store = store.lock().await;
        match store.load_snapshot(key, self.index.dimensions()) {
            Ok(snapshot) => snapshot,
            Err(e @ StoreError::Corrupt { .. }) => {
                warn!("Discarding snapshot: {e}");
                report.warn("", WarningKind::Snapshot, e.to_string());
                if let Err(e) = store.delete_snapshot(key) {
                    warn!("Failed to delete corrupt snapshot: {e}");
                }
                None
            }
            Err(e) => {
                warn!("Failed to load snapshot: {e}");
                report.warn("", WarningKind::Snapshot, e.to_string());
                None
            }
        }
    }

    /// Every parsed file has a module chunk, so files absent from a snapshot
    /// failed to parse when it was built. Parse them again to report why.
    fn replay_parse_warnings(
        &self,
        sources: &[SourceFile],
        chunked: &HashSet<String>,
        report: &mut IndexReport,
    ) {
        for file in sources.iter().filter(|f| !chunked.contains(&f.rel_path)) {
            let module = module_name_for(&file.rel_path);
            if let Err(e) = self.ctx.parser.parse_source(&file.source, &module) {
                warn!("Skipping {}: {e}", file.rel_path);
                report.warn(&file.rel_path, WarningKind::Parse, e.to_string());
            }
        }
    }

    async fn discard_snapshot(&self, key: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.lock().await.delete_snapshot(key) {
                warn!("Failed to delete corrupt snapshot: {e}");
            }
        }
    }

    /// Best effort: only fully embedded generations are saved.
    async fn save_snapshot(&self, key: &str, generation: &Generation, report: &mut IndexReport) {
        let Some(store) = &self.store else {
            return;
        };
        if self.keep_snapshots == 0 || generation.embedded_len() != generation.len() {
            return;
        }

        let mut store = store.lock().await;
        let saved = store
            .save_snapshot(key, generation)
            .and_then(|()| store.prune(self.keep_snapshots));
        match saved {
            Ok(pruned) => debug!("Saved snapshot {key} (pruned {pruned})"),
            Err(e) => {
                warn!("Failed to save snapshot: {e}");
                report.warn("", WarningKind::Snapshot, e.to_string());
            }
        }
    }
}

fn finish(report: &mut IndexReport, generation: &Generation, started: Instant) {
    report.generation_id = generation.id();
    report.chunks_indexed = generation.len();
    report.chunks_unembedded = generation.len() - generation.embedded_len();
    report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
}

/// Extract, chunk and embed one file. Never fails; problems become warnings.
async fn process_file(
    ctx: Arc<FileContext>,
    file: SourceFile,
    previous: Arc<Generation>,
) -> FileOutcome {
    let mut outcome = FileOutcome {
        rel_path: file.rel_path.clone(),
        ..FileOutcome::default()
    };

    let module = module_name_for(&file.rel_path);
    let tree = match ctx.parser.parse_source(&file.source, &module) {
        Ok(tree) => tree,
        Err(e) => {
            warn!("Skipping {}: {e}", file.rel_path);
            outcome.warnings.push(IndexWarning {
                path: file.rel_path,
                kind: WarningKind::Parse,
                message: e.to_string(),
            });
            return outcome;
        }
    };
    outcome.parsed = true;

    let chunks = build_chunks(&file.source, &file.rel_path, &tree, &ctx.chunker);
    debug!("{}: {} chunks", file.rel_path, chunks.len());

    for chunk in chunks {
        let unchanged = previous
            .get(&chunk.id)
            .is_some_and(|old| old.text == chunk.text);
        if unchanged {
            if let Some(vector) = previous.vector_of(&chunk.id) {
                outcome.reused += 1;
                outcome.chunks.push(EmbeddedChunk {
                    chunk,
                    vector: Some(vector.to_vec()),
                });
                continue;
            }
        }

        let text = chunk.embedding_text();
        let vector = match embed_with_retry(ctx.embedder.as_ref(), &text, &ctx.retry).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("Leaving {} unembedded: {e}", chunk.qualified_name);
                outcome.warnings.push(IndexWarning {
                    path: file.rel_path.clone(),
                    kind: WarningKind::Embedding,
                    message: format!("{}: {e}", chunk.qualified_name),
                });
                None
            }
        };
        outcome.chunks.push(EmbeddedChunk { chunk, vector });
    }

    outcome
}

async fn read_source(root: &Path, rel_path: &str) -> Result<SourceFile, String> {
    let bytes = tokio::fs::read(root.join(rel_path))
        .await
        .map_err(|e| e.to_string())?;
    let hash = format!("{:x}", Sha256::digest(&bytes));
    let source = String::from_utf8(bytes).map_err(|_| "file is not valid UTF-8".to_string())?;
    Ok(SourceFile {
        rel_path: rel_path.to_string(),
        source,
        hash,
    })
}

/// `/`-separated path of `path` relative to `root`; relative inputs are taken as root-relative.
fn relative_path(root: &Path, path: &Path) -> Result<String, IndexerError> {
    let rel = if path.is_absolute() {
        path.strip_prefix(root).ok()
    } else {
        Some(path)
    };
    let outside = || IndexerError::OutsideRoot {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    };
    let rel = rel.ok_or_else(outside)?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(outside()),
        }
    }
    if parts.is_empty() {
        return Err(outside());
    }
    Ok(parts.join("/"))
}
