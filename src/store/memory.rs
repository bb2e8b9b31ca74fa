use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{ChunkRecord, ChunkStore, FileKey, FileRecord, Result, StoreError};

/// Volatile store, used when no store directory is configured and in tests.
#[derive(Default)]
pub struct MemoryChunkStore {
  chunks: Mutex<HashMap<(FileKey, u64), ChunkRecord>>,
  files: Mutex<HashMap<FileKey, FileRecord>>,
}

impl MemoryChunkStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn chunk_count(&self) -> usize {
    self.chunks.lock().await.len()
  }

  pub async fn file_count(&self) -> usize {
    self.files.lock().await.len()
  }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
  async fn put_chunk(&self, chunk: ChunkRecord) -> Result<()> {
    self
      .chunks
      .lock()
      .await
      .insert((chunk.key.clone(), chunk.start_offset), chunk);
    Ok(())
  }

  async fn chunks_by_file(&self, key: &FileKey) -> Result<Vec<ChunkRecord>> {
    let chunks = self.chunks.lock().await;
    Ok(chunks.values().filter(|chunk| &chunk.key == key).cloned().collect())
  }

  async fn delete_chunk(&self, key: &FileKey, start_offset: u64) -> Result<()> {
    self.chunks.lock().await.remove(&(key.clone(), start_offset));
    Ok(())
  }

  async fn clear_chunks(&self) -> Result<()> {
    self.chunks.lock().await.clear();
    Ok(())
  }

  async fn put_file(&self, file: FileRecord) -> Result<()> {
    self.files.lock().await.insert(file.key.clone(), file);
    Ok(())
  }

  async fn get_file(&self, key: &FileKey) -> Result<FileRecord> {
    self
      .files
      .lock()
      .await
      .get(key)
      .cloned()
      .ok_or_else(|| StoreError::NotFound(key.id()))
  }

  async fn delete_file(&self, key: &FileKey) -> Result<()> {
    self.files.lock().await.remove(key);
    Ok(())
  }

  async fn clear_files(&self) -> Result<()> {
    self.files.lock().await.clear();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn chunk(peer: &str, hash: &str, offset: u64, data: &'static [u8]) -> ChunkRecord {
    ChunkRecord {
      key: FileKey::new(peer, hash),
      start_offset: offset,
      data: Bytes::from_static(data),
    }
  }

  #[tokio::test]
  async fn chunks_are_indexed_by_peer_and_file() {
    let store = MemoryChunkStore::new();
    store.put_chunk(chunk("a", "h1", 0, b"one")).await.unwrap();
    store.put_chunk(chunk("a", "h1", 3, b"two")).await.unwrap();
    store.put_chunk(chunk("b", "h1", 0, b"other")).await.unwrap();

    let chunks = store.chunks_by_file(&FileKey::new("a", "h1")).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.key.peer_id == "a"));
  }

  #[tokio::test]
  async fn delete_chunks_by_file_leaves_other_keys() {
    let store = MemoryChunkStore::new();
    store.put_chunk(chunk("a", "h1", 0, b"one")).await.unwrap();
    store.put_chunk(chunk("a", "h2", 0, b"two")).await.unwrap();

    let removed = store.delete_chunks_by_file(&FileKey::new("a", "h1")).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.chunk_count().await, 1);
  }

  #[tokio::test]
  async fn missing_file_is_not_found() {
    let store = MemoryChunkStore::new();
    let err = store.get_file(&FileKey::new("a", "nope")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
  }
}
