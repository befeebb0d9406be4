use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};

use super::{SnapshotStore, StoreError, deserialize_vector, serialize_vector};
use crate::index::Generation;
use crate::models::{Chunk, EmbeddedChunk, SymbolKind};

/// A persisted generation, ready to be rebuilt into the index.
#[derive(Debug)]
pub struct Snapshot {
    pub key: String,
    pub dimensions: usize,
    pub created_at: DateTime<Utc>,
    pub files: BTreeMap<String, String>,
    pub chunks: Vec<EmbeddedChunk>,
}

/// Key of a file set: SHA-256 over `profile` and the sorted (path, content hash) pairs.
///
/// `profile` names everything besides file content that shapes the chunks
/// and vectors, such as the embedder and chunk size.
pub fn snapshot_key(profile: &str, files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(profile.as_bytes());
    hasher.update(b"\n");
    for (path, hash) in files {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

impl SnapshotStore {
    /// Store `generation` under `key`, replacing any snapshot with the same key.
    pub fn save_snapshot(&mut self, key: &str, generation: &Generation) -> Result<(), StoreError> {
        let files = serde_json::to_string(generation.files())?;
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM snapshots WHERE key = ?", params![key])?;
        tx.execute(
            "INSERT INTO snapshots (key, dimensions, chunk_count, files, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                key,
                generation.dimensions() as i64,
                generation.len() as i64,
                files,
                Utc::now()
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshot_chunks (snapshot_key, chunk_id, file_path, start_line, end_line, kind, qualified_name, docstring, signature, metadata, content, truncated, parent_id, embedding)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for (chunk, vector) in generation.entries() {
                stmt.execute(params![
                    key,
                    chunk.id,
                    chunk.file_path,
                    chunk.start_line as i64,
                    chunk.end_line as i64,
                    chunk.kind.as_str(),
                    chunk.qualified_name,
                    chunk.docstring,
                    serde_json::to_string(&chunk.signature)?,
                    serde_json::to_string(&chunk.metadata)?,
                    chunk.text,
                    chunk.truncated,
                    chunk.parent_id,
                    vector.map(serialize_vector),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the snapshot stored under `key`, if any.
    ///
    /// Returns [`StoreError::Corrupt`] when the stored rows do not describe a
    /// well-formed snapshot of `dimensions`-sized vectors.
    pub fn load_snapshot(
        &self,
        key: &str,
        dimensions: usize,
    ) -> Result<Option<Snapshot>, StoreError> {
        let header: Option<(i64, i64, String, DateTime<Utc>)> = self
            .conn
            .query_row(
                "SELECT dimensions, chunk_count, files, created_at FROM snapshots WHERE key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((stored_dims, chunk_count, files, created_at)) = header else {
            return Ok(None);
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.to_string(),
            reason,
        };

        if stored_dims != dimensions as i64 {
            return Err(corrupt(format!(
                "stored dimension {stored_dims}, expected {dimensions}"
            )));
        }
        let files: BTreeMap<String, String> =
            serde_json::from_str(&files).map_err(|e| corrupt(format!("file set: {e}")))?;

        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, file_path, start_line, end_line, kind, qualified_name, docstring, signature, metadata, content, truncated, parent_id, embedding
             FROM snapshot_chunks WHERE snapshot_key = ? ORDER BY chunk_id",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok(StoredChunk {
                id: row.get(0)?,
                file_path: row.get(1)?,
                start_line: row.get(2)?,
                end_line: row.get(3)?,
                kind: row.get(4)?,
                qualified_name: row.get(5)?,
                docstring: row.get(6)?,
                signature: row.get(7)?,
                metadata: row.get(8)?,
                text: row.get(9)?,
                truncated: row.get(10)?,
                parent_id: row.get(11)?,
                embedding: row.get(12)?,
            })
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let stored = row?;
            chunks.push(stored.into_embedded(dimensions).map_err(corrupt)?);
        }

        if chunks.len() as i64 != chunk_count {
            return Err(corrupt(format!(
                "expected {chunk_count} chunks, found {}",
                chunks.len()
            )));
        }

        Ok(Some(Snapshot {
            key: key.to_string(),
            dimensions,
            created_at,
            files,
            chunks,
        }))
    }

    /// Delete the snapshot stored under `key`.
    pub fn delete_snapshot(&self, key: &str) -> Result<bool, StoreError> {
        let rows = self
            .conn
            .execute("DELETE FROM snapshots WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    /// Keep the newest `keep` snapshots and delete the rest. Returns the number deleted.
    pub fn prune(&self, keep: usize) -> Result<usize, StoreError> {
        let rows = self.conn.execute(
            "DELETE FROM snapshots WHERE key NOT IN (
                SELECT key FROM snapshots ORDER BY created_at DESC, rowid DESC LIMIT ?
             )",
            params![keep as i64],
        )?;
        Ok(rows)
    }

    /// Keys of stored snapshots, newest first.
    pub fn snapshot_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM snapshots ORDER BY created_at DESC, rowid DESC")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

struct StoredChunk {
    id: String,
    file_path: String,
    start_line: i64,
    end_line: i64,
    kind: String,
    qualified_name: String,
    docstring: Option<String>,
    signature: String,
    metadata: String,
    text: String,
    truncated: bool,
    parent_id: Option<String>,
    embedding: Option<Vec<u8>>,
}

impl StoredChunk {
    fn into_embedded(self, dimensions: usize) -> Result<EmbeddedChunk, String> {
        let kind: SymbolKind = self.kind.parse()?;
        let signature = serde_json::from_str(&self.signature)
            .map_err(|e| format!("chunk {}: signature: {e}", self.id))?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| format!("chunk {}: metadata: {e}", self.id))?;
        let start_line = usize::try_from(self.start_line)
            .map_err(|_| format!("chunk {}: negative start line", self.id))?;
        let end_line = usize::try_from(self.end_line)
            .map_err(|_| format!("chunk {}: negative end line", self.id))?;

        let vector = match self.embedding {
            Some(bytes) => {
                let vector = deserialize_vector(&bytes)
                    .filter(|v| v.len() == dimensions)
                    .ok_or_else(|| {
                        format!("chunk {}: embedding blob of {} bytes", self.id, bytes.len())
                    })?;
                Some(vector)
            }
            None => None,
        };

        Ok(EmbeddedChunk {
            chunk: Chunk {
                id: self.id,
                file_path: self.file_path,
                start_line,
                end_line,
                kind,
                qualified_name: self.qualified_name,
                docstring: self.docstring,
                signature,
                metadata,
                text: self.text,
                truncated: self.truncated,
                parent_id: self.parent_id,
            },
            vector,
        })
    }
}
