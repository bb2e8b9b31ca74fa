//! Durable storage for in-flight receive chunks and reassembled files.
//!
//! Two logical tables: chunk records, unique per `(peer, file, offset)` and
//! indexed by `(peer, file)`, and completed files keyed by `(peer, file)`.
//! Implementations are shared by every per-key persistence worker; the only
//! write ordering they need to honor is the one those workers already impose.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::transfer::{sanitize_file_name, FileMeta};

pub mod disk;
pub mod memory;

pub use disk::DiskChunkStore;
pub use memory::MemoryChunkStore;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("codec error: {0}")]
  Codec(#[from] serde_json::Error),
  #[error("record not found: {0}")]
  NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Identifies one file received from one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
  pub peer_id: String,
  pub file_hash: String,
}

impl FileKey {
  pub fn new(peer_id: impl Into<String>, file_hash: impl Into<String>) -> Self {
    Self {
      peer_id: peer_id.into(),
      file_hash: file_hash.into(),
    }
  }

  /// Stable identity for storage paths. The peer id is length-prefixed so no
  /// two keys share an id, whatever characters the parts contain.
  pub fn id(&self) -> String {
    format!("{}:{}-{}", self.peer_id.len(), self.peer_id, self.file_hash)
  }
}

impl fmt::Display for FileKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.peer_id, self.file_hash)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
  pub key: FileKey,
  pub start_offset: u64,
  pub data: Bytes,
}

impl ChunkRecord {
  pub fn id(&self) -> String {
    format!("{}-{}", self.key.id(), self.start_offset)
  }

  pub fn len(&self) -> u64 {
    self.data.len() as u64
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
  pub key: FileKey,
  pub meta: FileMeta,
  pub data: Bytes,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
  async fn put_chunk(&self, chunk: ChunkRecord) -> Result<()>;
  /// Every chunk recorded for `key`. Order is unspecified.
  async fn chunks_by_file(&self, key: &FileKey) -> Result<Vec<ChunkRecord>>;
  async fn delete_chunk(&self, key: &FileKey, start_offset: u64) -> Result<()>;
  async fn clear_chunks(&self) -> Result<()>;

  async fn put_file(&self, file: FileRecord) -> Result<()>;
  async fn get_file(&self, key: &FileKey) -> Result<FileRecord>;
  async fn delete_file(&self, key: &FileKey) -> Result<()>;
  async fn clear_files(&self) -> Result<()>;

  /// Deletes every chunk indexed under `key`, returning how many were removed.
  async fn delete_chunks_by_file(&self, key: &FileKey) -> Result<usize> {
    let chunks = self.chunks_by_file(key).await?;
    for chunk in &chunks {
      self.delete_chunk(key, chunk.start_offset).await?;
    }
    Ok(chunks.len())
  }
}

/// Re-reads a completed file from the store on demand.
#[derive(Clone)]
pub struct FileExporter {
  store: Arc<dyn ChunkStore>,
  key: FileKey,
}

impl fmt::Debug for FileExporter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FileExporter").field("key", &self.key).finish()
  }
}

impl FileExporter {
  pub fn new(store: Arc<dyn ChunkStore>, key: FileKey) -> Self {
    Self { store, key }
  }

  pub fn key(&self) -> &FileKey {
    &self.key
  }

  pub async fn export(&self) -> Result<FileRecord> {
    self.store.get_file(&self.key).await
  }

  /// Writes the file into `dir` under its sanitized announced name.
  pub async fn save_to(&self, dir: &Path) -> Result<PathBuf> {
    let file = self.export().await?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(sanitize_file_name(&file.meta.name));
    tokio::fs::write(&path, &file.data).await?;
    Ok(path)
  }
}
