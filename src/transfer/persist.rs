//! Receive-side chunk persistence, serialized per `(peer, file)`.
//!
//! Each key owns one worker task draining an ordered queue, so writes for a
//! key never overlap and the running byte offset is carried from one step to
//! the next. Different keys persist independently.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::progress::ReceivingTracker;
use crate::store::{ChunkRecord, ChunkStore, FileExporter, FileKey, FileRecord, StoreError};

enum PersistTask {
  Append(Bytes),
  Reset,
  /// The sender finished; merges files whose size never triggered one (empty files).
  Complete,
  Flush(oneshot::Sender<()>),
}

struct WorkerSlot {
  id: u64,
  tx: mpsc::UnboundedSender<PersistTask>,
  handle: JoinHandle<()>,
}

struct Shared {
  store: Arc<dyn ChunkStore>,
  tracker: Arc<ReceivingTracker>,
  queues: Mutex<HashMap<FileKey, WorkerSlot>>,
  /// Set by `shutdown`; refuses new work until `reopen`.
  closed: AtomicBool,
  next_id: AtomicU64,
}

pub struct PersistScheduler {
  shared: Arc<Shared>,
}

impl PersistScheduler {
  pub fn new(store: Arc<dyn ChunkStore>, tracker: Arc<ReceivingTracker>) -> Self {
    Self {
      shared: Arc::new(Shared {
        store,
        tracker,
        queues: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  pub fn store(&self) -> &Arc<dyn ChunkStore> {
    &self.shared.store
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.load(Ordering::Acquire)
  }

  /// Number of keys with a live worker.
  pub async fn active_workers(&self) -> usize {
    self.shared.queues.lock().await.len()
  }

  async fn schedule(&self, key: &FileKey, task: PersistTask) {
    let mut queues = self.shared.queues.lock().await;
    if self.is_closed() {
      debug!(event = "persist_task_rejected", key = %key);
      return;
    }
    let task = match queues.get(key) {
      Some(slot) => match slot.tx.send(task) {
        Ok(()) => return,
        Err(mpsc::error::SendError(task)) => task,
      },
      None => task,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
    let worker = KeyWorker {
      id,
      key: key.clone(),
      shared: self.shared.clone(),
      offset: 0,
    };
    let _ = tx.send(task);
    let handle = tokio::spawn(worker.run(rx));
    queues.insert(key.clone(), WorkerSlot { id, tx, handle });
  }

  /// Queues `data` to be stored at the offset the previous step left off at.
  pub async fn append(&self, key: &FileKey, data: Bytes) {
    self.schedule(key, PersistTask::Append(data)).await;
  }

  /// Queues deletion of every chunk buffered for `key` and zeroes its progress.
  pub async fn reset(&self, key: &FileKey) {
    self.schedule(key, PersistTask::Reset).await;
  }

  pub async fn complete(&self, key: &FileKey) {
    self.schedule(key, PersistTask::Complete).await;
  }

  /// Resolves once everything queued for `key` before this call has run.
  pub async fn flush(&self, key: &FileKey) {
    let (tx, rx) = oneshot::channel();
    self.schedule(key, PersistTask::Flush(tx)).await;
    let _ = rx.await;
  }

  pub async fn clear_all_file_buffers_received(&self) {
    match self.shared.store.clear_chunks().await {
      Ok(()) => info!(event = "received_buffers_cleared"),
      Err(err) => error!(event = "clear_chunks_failed", error = %err),
    }
  }

  pub async fn clear_all_files_received(&self) {
    match self.shared.store.clear_files().await {
      Ok(()) => info!(event = "received_files_cleared"),
      Err(err) => error!(event = "clear_files_failed", error = %err),
    }
    self.shared.tracker.clear_exporters().await;
  }

  /// Refuses further work, drops whatever is still queued, and waits for
  /// every worker to finish the step it is on. Nothing writes to the store
  /// once this returns.
  pub async fn shutdown(&self) {
    let slots: Vec<WorkerSlot> = {
      let mut queues = self.shared.queues.lock().await;
      self.shared.closed.store(true, Ordering::Release);
      queues.drain().map(|(_, slot)| slot).collect()
    };
    let stopped = slots.len();
    for WorkerSlot { tx, handle, .. } in slots {
      drop(tx);
      if let Err(err) = handle.await {
        error!(event = "persist_worker_panicked", error = %err);
      }
    }
    info!(event = "persist_shutdown", workers = stopped);
  }

  /// Accepts work again after `shutdown`.
  pub fn reopen(&self) {
    self.shared.closed.store(false, Ordering::Release);
  }
}

struct KeyWorker {
  id: u64,
  key: FileKey,
  shared: Arc<Shared>,
  offset: u64,
}

impl KeyWorker {
  async fn run(mut self, mut tasks: mpsc::UnboundedReceiver<PersistTask>) {
    let mut next = None;
    loop {
      let task = match next.take() {
        Some(task) => task,
        None => match tasks.recv().await {
          Some(task) => task,
          None => break,
        },
      };
      if self.shared.closed.load(Ordering::Acquire) {
        break;
      }
      let merged = match task {
        PersistTask::Append(data) => self.append(data).await,
        PersistTask::Reset => {
          self.reset().await;
          false
        }
        PersistTask::Complete => self.complete().await,
        PersistTask::Flush(done) => {
          let _ = done.send(());
          false
        }
      };
      if merged || self.offset == 0 {
        match self.retire(&mut tasks).await {
          Some(task) => next = Some(task),
          None => break,
        }
      }
    }
    debug!(event = "persist_worker_stopped", key = %self.key);
  }

  /// Gives up the key's slot once the file merged or no offset is carried,
  /// unless a task is already waiting, which is returned instead.
  async fn retire(&self, tasks: &mut mpsc::UnboundedReceiver<PersistTask>) -> Option<PersistTask> {
    let mut queues = self.shared.queues.lock().await;
    if let Ok(task) = tasks.try_recv() {
      return Some(task);
    }
    if queues.get(&self.key).is_some_and(|slot| slot.id == self.id) {
      queues.remove(&self.key);
    }
    None
  }

  /// Returns whether the step merged the file.
  async fn append(&mut self, data: Bytes) -> bool {
    let store = &self.shared.store;
    let tracker = &self.shared.tracker;
    let start_offset = self.offset;
    let len = data.len() as u64;
    let chunk = ChunkRecord {
      key: self.key.clone(),
      start_offset,
      data,
    };
    if let Err(err) = store.put_chunk(chunk).await {
      error!(event = "chunk_persist_failed", key = %self.key, offset = start_offset, error = %err);
      return false;
    }

    // Cancelled while the write was in flight.
    if tracker.is_cancelled(&self.key).await {
      if let Err(err) = store.delete_chunk(&self.key, start_offset).await {
        error!(event = "chunk_rollback_failed", key = %self.key, offset = start_offset, error = %err);
      }
      debug!(event = "chunk_rolled_back", key = %self.key, offset = start_offset);
      return false;
    }

    self.offset += len;
    let progress = tracker.add_progress(&self.key, len).await;
    let Some(meta) = tracker.meta(&self.key).await else {
      return false;
    };
    progress >= meta.size && self.merge().await
  }

  async fn reset(&mut self) {
    match self.shared.store.delete_chunks_by_file(&self.key).await {
      Ok(removed) => debug!(event = "chunks_reset", key = %self.key, removed),
      Err(err) => error!(event = "chunks_reset_failed", key = %self.key, error = %err),
    }
    self.offset = 0;
    self.shared.tracker.reset_progress(&self.key).await;
  }

  /// Returns whether the step merged the file.
  async fn complete(&mut self) -> bool {
    let tracker = &self.shared.tracker;
    if tracker.is_cancelled(&self.key).await || tracker.exporter(&self.key).await.is_some() {
      return false;
    }
    let Some(meta) = tracker.meta(&self.key).await else {
      return false;
    };
    self.offset >= meta.size && self.merge().await
  }

  async fn merge(&self) -> bool {
    match merge_chunks(&self.shared.store, &self.shared.tracker, &self.key).await {
      Ok(exporter) => {
        info!(event = "file_received", key = %exporter.key());
        true
      }
      Err(err) => {
        error!(event = "merge_failed", key = %self.key, error = %err);
        false
      }
    }
  }
}

/// Concatenates the key's chunks by ascending offset into one file record,
/// drops the chunks, and registers an exporter for the result.
pub async fn merge_chunks(
  store: &Arc<dyn ChunkStore>,
  tracker: &ReceivingTracker,
  key: &FileKey,
) -> Result<FileExporter, StoreError> {
  let meta = tracker
    .meta(key)
    .await
    .ok_or_else(|| StoreError::NotFound(format!("meta data for {key}")))?;
  let mut chunks = store.chunks_by_file(key).await?;
  chunks.sort_by_key(|chunk| chunk.start_offset);

  let mut data = BytesMut::with_capacity(meta.size as usize);
  for chunk in &chunks {
    data.extend_from_slice(&chunk.data);
  }
  store
    .put_file(FileRecord {
      key: key.clone(),
      meta,
      data: data.freeze(),
    })
    .await?;
  for chunk in &chunks {
    store.delete_chunk(key, chunk.start_offset).await?;
  }

  let exporter = FileExporter::new(store.clone(), key.clone());
  tracker.register_exporter(exporter.clone()).await;
  Ok(exporter)
}
