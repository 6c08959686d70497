//! Read-only chunk storage shared by the sender and the gateway.
//!
//! Layout mirrors the segmenter's output: one directory per rung of the
//! bitrate ladder, `video1` (lowest) through `video6`, each holding
//! `Header.m4s` (the init segment, chunk 0) and `1.m4s`, `2.m4s`, ... for
//! the media segments.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use chute_protocol::packet::{ChunkId, MAX_CHUNK_ID};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("chunk file {0} missing from storage")]
    Missing(PathBuf),
    #[error("path {0:?} escapes the storage root")]
    OutsideRoot(String),
    #[error("file name {0:?} does not parse as a chunk number")]
    BadChunkName(String),
    #[error("chunk number {0} exceeds the two-digit wire field")]
    ChunkOutOfRange(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolves `(tier, chunk)` pairs to files under one root. Immutable and
/// safely shared across streams.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a chunk relative to the root, as carried in transfer
    /// requests.
    pub fn relative_path(tier: usize, chunk: ChunkId) -> String {
        if chunk.0 == 0 {
            format!("video{}/Header.m4s", tier + 1)
        } else {
            format!("video{}/{}.m4s", tier + 1, chunk)
        }
    }

    /// Resolves a request-carried relative path, rejecting anything that
    /// would escape the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StorageError::OutsideRoot(relative.to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// Size in bytes of the stored chunk, used by the gateway to validate
    /// reassembly.
    pub async fn chunk_len(&self, relative: &str) -> Result<u64, StorageError> {
        let path = self.resolve(relative)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::Missing(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses the chunk id out of a chunk file path: decimal digits, or
    /// `Header` for the init segment. The id must fit the wire field; a
    /// file the protocol cannot address is rejected here, before any
    /// transfer starts.
    pub fn chunk_id_of(relative: &str) -> Result<ChunkId, StorageError> {
        let stem = Path::new(relative)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| StorageError::BadChunkName(relative.to_string()))?;
        if stem == "Header" {
            return Ok(ChunkId(0));
        }
        let value: u32 = stem
            .parse()
            .map_err(|_| StorageError::BadChunkName(relative.to_string()))?;
        if value > MAX_CHUNK_ID {
            return Err(StorageError::ChunkOutOfRange(value));
        }
        Ok(ChunkId(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths() {
        assert_eq!(ChunkStore::relative_path(4, ChunkId(0)), "video5/Header.m4s");
        assert_eq!(ChunkStore::relative_path(0, ChunkId(17)), "video1/17.m4s");
    }

    #[test]
    fn chunk_ids_from_paths() {
        assert_eq!(
            ChunkStore::chunk_id_of("video5/Header.m4s").unwrap(),
            ChunkId(0)
        );
        assert_eq!(ChunkStore::chunk_id_of("video2/33.m4s").unwrap(), ChunkId(33));
        assert!(ChunkStore::chunk_id_of("video2/init.m4s").is_err());
        // addressable ids stop where the wire field does
        assert!(matches!(
            ChunkStore::chunk_id_of("video2/150.m4s"),
            Err(StorageError::ChunkOutOfRange(150))
        ));
    }

    #[test]
    fn traversal_rejected() {
        let store = ChunkStore::new("/srv/chunks");
        assert!(store.resolve("video1/3.m4s").is_ok());
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn missing_chunk_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        assert!(matches!(
            store.chunk_len("video1/1.m4s").await,
            Err(StorageError::Missing(_))
        ));

        tokio::fs::create_dir(dir.path().join("video1")).await.unwrap();
        tokio::fs::write(dir.path().join("video1/1.m4s"), b"abcdef")
            .await
            .unwrap();
        assert_eq!(store.chunk_len("video1/1.m4s").await.unwrap(), 6);
    }
}
