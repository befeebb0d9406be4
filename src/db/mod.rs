//! Snapshot persistence using SQLite.
//!
//! A snapshot is a published generation stored under the hash of the file
//! set it was built from, so an unchanged project can be served again
//! without re-embedding.
use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

pub mod snapshots;

pub use snapshots::{Snapshot, snapshot_key};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    key TEXT PRIMARY KEY,
    dimensions INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL,
    files TEXT NOT NULL,
    created_at DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_created ON snapshots(created_at);

CREATE TABLE IF NOT EXISTS snapshot_chunks (
    snapshot_key TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    kind TEXT NOT NULL,
    qualified_name TEXT NOT NULL,
    docstring TEXT,
    signature TEXT NOT NULL,
    metadata TEXT NOT NULL,
    content TEXT NOT NULL,
    truncated INTEGER NOT NULL,
    parent_id TEXT,
    embedding BLOB,
    PRIMARY KEY (snapshot_key, chunk_id),
    FOREIGN KEY (snapshot_key) REFERENCES snapshots(key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_snapshot_chunks_file ON snapshot_chunks(file_path);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    /// The stored snapshot cannot be trusted and must be rebuilt.
    #[error("snapshot {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

/// A SQLite connection initialized with the snapshot schema.
pub struct SnapshotStore {
    pub(crate) conn: Connection,
}

impl SnapshotStore {
    /// Open a database at the given path, creating parent directories and the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Initializing snapshot database: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

/// Serialize a float32 vector into little-endian bytes.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`serialize_vector`]; `None` if the length is not a multiple of 4.
pub fn deserialize_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    let mut out = vec![0f32; bytes.len() / 4];
    bytemuck::cast_slice_mut::<f32, u8>(&mut out).copy_from_slice(bytes);
    for v in &mut out {
        *v = f32::from_bits(u32::from_le(v.to_bits()));
    }
    Some(out)
}
