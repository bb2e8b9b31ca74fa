//! On-disk store.
//!
//! Layout under the root directory:
//! `chunks/<sha256(file id)>/<offset>.chunk` and
//! `files/<sha256(file id)>/{data,meta.json}`.
//! Every write lands in a `.tmp` sibling first and is renamed into place.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ChunkRecord, ChunkStore, FileKey, FileRecord, Result, StoreError};
use crate::transfer::FileMeta;

const CHUNK_EXT: &str = "chunk";

pub struct DiskChunkStore {
  chunks_root: PathBuf,
  files_root: PathBuf,
}

impl DiskChunkStore {
  pub async fn open(root: &Path) -> Result<Self> {
    let chunks_root = root.join("chunks");
    let files_root = root.join("files");
    fs::create_dir_all(&chunks_root).await?;
    fs::create_dir_all(&files_root).await?;
    Ok(Self { chunks_root, files_root })
  }

  fn key_dir(root: &Path, key: &FileKey) -> PathBuf {
    root.join(format!("{:x}", Sha256::digest(key.id().as_bytes())))
  }

  fn chunk_path(&self, key: &FileKey, start_offset: u64) -> PathBuf {
    Self::key_dir(&self.chunks_root, key).join(format!("{start_offset}.{CHUNK_EXT}"))
  }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).await?;
  }
  let tmp_path = path.with_extension("tmp");
  let mut file = fs::File::create(&tmp_path).await?;
  file.write_all(data).await?;
  file.sync_all().await?;
  drop(file);
  fs::rename(&tmp_path, path).await?;
  Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
  match fs::remove_file(path).await {
    Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
    _ => Ok(()),
  }
}

async fn reset_dir(path: &Path) -> Result<()> {
  match fs::remove_dir_all(path).await {
    Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
    _ => {}
  }
  fs::create_dir_all(path).await?;
  Ok(())
}

#[async_trait]
impl ChunkStore for DiskChunkStore {
  async fn put_chunk(&self, chunk: ChunkRecord) -> Result<()> {
    let path = self.chunk_path(&chunk.key, chunk.start_offset);
    write_atomic(&path, &chunk.data).await?;
    tracing::debug!(event = "chunk_stored", id = %chunk.id(), size = chunk.data.len());
    Ok(())
  }

  async fn chunks_by_file(&self, key: &FileKey) -> Result<Vec<ChunkRecord>> {
    let dir = Self::key_dir(&self.chunks_root, key);
    let mut entries = match fs::read_dir(&dir).await {
      Ok(entries) => entries,
      Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(err) => return Err(err.into()),
    };
    let mut chunks = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if path.extension().and_then(|ext| ext.to_str()) != Some(CHUNK_EXT) {
        continue;
      }
      let Some(start_offset) = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse::<u64>().ok())
      else {
        continue;
      };
      let data = fs::read(&path).await?;
      chunks.push(ChunkRecord {
        key: key.clone(),
        start_offset,
        data: Bytes::from(data),
      });
    }
    Ok(chunks)
  }

  async fn delete_chunk(&self, key: &FileKey, start_offset: u64) -> Result<()> {
    remove_if_exists(&self.chunk_path(key, start_offset)).await
  }

  async fn clear_chunks(&self) -> Result<()> {
    reset_dir(&self.chunks_root).await
  }

  async fn put_file(&self, file: FileRecord) -> Result<()> {
    let dir = Self::key_dir(&self.files_root, &file.key);
    write_atomic(&dir.join("data"), &file.data).await?;
    write_atomic(&dir.join("meta.json"), &serde_json::to_vec(&file.meta)?).await?;
    tracing::debug!(event = "file_stored", id = %file.key, size = file.data.len());
    Ok(())
  }

  async fn get_file(&self, key: &FileKey) -> Result<FileRecord> {
    let dir = Self::key_dir(&self.files_root, key);
    let meta = match fs::read(dir.join("meta.json")).await {
      Ok(raw) => raw,
      Err(err) if err.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(key.id())),
      Err(err) => return Err(err.into()),
    };
    let meta: FileMeta = serde_json::from_slice(&meta)?;
    let data = fs::read(dir.join("data")).await?;
    Ok(FileRecord {
      key: key.clone(),
      meta,
      data: Bytes::from(data),
    })
  }

  async fn delete_file(&self, key: &FileKey) -> Result<()> {
    let dir = Self::key_dir(&self.files_root, key);
    match fs::remove_dir_all(&dir).await {
      Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
      _ => Ok(()),
    }
  }

  async fn clear_files(&self) -> Result<()> {
    reset_dir(&self.files_root).await
  }
}
