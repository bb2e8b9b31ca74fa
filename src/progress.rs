//! Peer x file progress bookkeeping for both directions of a transfer.
//!
//! Sending side: published meta data, per-peer byte offsets, per-file cancel
//! flags and the derived "is anything sending" status. Receiving side:
//! per-peer meta data, offsets, per-(peer, file) cancel flags and the
//! exporters of completed files. Every mutation pushes a snapshot to the
//! tracker's subscriber.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::listener::Listener;
use crate::store::{FileExporter, FileKey};
use crate::transfer::FileMeta;

/// `peer -> file hash -> byte offset`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressTable {
  peers: BTreeMap<String, BTreeMap<String, u64>>,
}

impl ProgressTable {
  pub fn get(&self, peer_id: &str, file_hash: &str) -> u64 {
    self
      .peers
      .get(peer_id)
      .and_then(|files| files.get(file_hash))
      .copied()
      .unwrap_or(0)
  }

  pub fn set(&mut self, peer_id: &str, file_hash: &str, value: u64) {
    self
      .peers
      .entry(peer_id.to_string())
      .or_default()
      .insert(file_hash.to_string(), value);
  }

  pub fn add(&mut self, peer_id: &str, file_hash: &str, delta: u64) -> u64 {
    let value = self.get(peer_id, file_hash).saturating_add(delta);
    self.set(peer_id, file_hash, value);
    value
  }

  pub fn reset(&mut self, peer_id: &str, file_hash: &str) {
    self.set(peer_id, file_hash, 0);
  }

  /// Minimum offset over the peers that recorded one for `file_hash`; 0 when
  /// nobody did.
  pub fn min_across_peers(&self, file_hash: &str) -> u64 {
    self
      .peers
      .values()
      .filter_map(|files| files.get(file_hash))
      .min()
      .copied()
      .unwrap_or(0)
  }

  pub fn by_peer(&self, file_hash: &str) -> BTreeMap<String, u64> {
    self
      .peers
      .iter()
      .filter_map(|(peer_id, files)| files.get(file_hash).map(|value| (peer_id.clone(), *value)))
      .collect()
  }

  pub fn remove_peer(&mut self, peer_id: &str) {
    self.peers.remove(peer_id);
  }

  pub fn clear(&mut self) {
    self.peers.clear();
  }
}

/// True while the slowest peer has received some, but not all, of the
/// non-cancelled files' bytes.
pub fn is_sending_status(
  metas: &BTreeMap<String, FileMeta>,
  progress: &ProgressTable,
  cancelled: &HashSet<String>,
) -> bool {
  let (sum_size, sum_min) = metas
    .iter()
    .filter(|(hash, _)| !cancelled.contains(*hash))
    .fold((0u64, 0u64), |(size, min), (hash, meta)| {
      (size + meta.size, min + progress.min_across_peers(hash))
    });
  sum_min > 0 && sum_min < sum_size
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingEntry {
  pub meta: FileMeta,
  pub min_progress: u64,
  pub progress_by_peer: BTreeMap<String, u64>,
  pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendingSnapshot {
  pub files: BTreeMap<String, SendingEntry>,
  pub is_sending: bool,
}

#[derive(Default)]
struct SendingState {
  metas: BTreeMap<String, FileMeta>,
  progress: ProgressTable,
  cancelled: HashSet<String>,
}

impl SendingState {
  fn is_sending(&self) -> bool {
    is_sending_status(&self.metas, &self.progress, &self.cancelled)
  }

  fn snapshot(&self) -> SendingSnapshot {
    let files = self
      .metas
      .iter()
      .map(|(hash, meta)| {
        let entry = SendingEntry {
          meta: meta.clone(),
          min_progress: self.progress.min_across_peers(hash),
          progress_by_peer: self.progress.by_peer(hash),
          cancelled: self.cancelled.contains(hash),
        };
        (hash.clone(), entry)
      })
      .collect();
    SendingSnapshot {
      files,
      is_sending: self.is_sending(),
    }
  }
}

#[derive(Default)]
pub struct SendingTracker {
  state: Mutex<SendingState>,
  listener: Listener<SendingSnapshot>,
}

impl SendingTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SendingSnapshot> {
    self.listener.subscribe().await
  }

  async fn publish(&self, state: &SendingState) {
    self.listener.notify(state.snapshot()).await;
  }

  /// Merges the batch's meta data into the published table.
  pub async fn prepare_meta(&self, files: &BTreeMap<String, FileMeta>) {
    let mut state = self.state.lock().await;
    for (hash, meta) in files {
      state.metas.insert(hash.clone(), meta.clone());
    }
    debug!(event = "sending_meta_prepared", files = files.len(), total = state.metas.len());
    self.publish(&state).await;
  }

  pub async fn check_prepared<'a>(&self, hashes: impl IntoIterator<Item = &'a String>) -> bool {
    let state = self.state.lock().await;
    hashes.into_iter().all(|hash| state.metas.contains_key(hash))
  }

  pub async fn meta(&self, file_hash: &str) -> Option<FileMeta> {
    self.state.lock().await.metas.get(file_hash).cloned()
  }

  pub async fn progress(&self, peer_id: &str, file_hash: &str) -> u64 {
    self.state.lock().await.progress.get(peer_id, file_hash)
  }

  pub async fn set_progress(&self, peer_id: &str, file_hash: &str, value: u64) {
    let mut state = self.state.lock().await;
    state.progress.set(peer_id, file_hash, value);
    self.publish(&state).await;
  }

  pub async fn add_progress(&self, peer_id: &str, file_hash: &str, delta: u64) -> u64 {
    let mut state = self.state.lock().await;
    let value = state.progress.add(peer_id, file_hash, delta);
    self.publish(&state).await;
    value
  }

  pub async fn reset_progress(&self, peer_id: &str, file_hash: &str) {
    self.set_progress(peer_id, file_hash, 0).await;
  }

  pub async fn min_progress(&self, file_hash: &str) -> u64 {
    self.state.lock().await.progress.min_across_peers(file_hash)
  }

  pub async fn is_sending(&self) -> bool {
    self.state.lock().await.is_sending()
  }

  pub async fn is_cancelled(&self, file_hash: &str) -> bool {
    self.state.lock().await.cancelled.contains(file_hash)
  }

  pub async fn set_cancelled(&self, file_hash: &str) {
    let mut state = self.state.lock().await;
    state.cancelled.insert(file_hash.to_string());
    self.publish(&state).await;
  }

  pub async fn clear_cancelled(&self) {
    self.state.lock().await.cancelled.clear();
  }

  pub async fn remove_peer(&self, peer_id: &str) {
    let mut state = self.state.lock().await;
    state.progress.remove_peer(peer_id);
    self.publish(&state).await;
  }

  pub async fn clear(&self) {
    let mut state = self.state.lock().await;
    *state = SendingState::default();
    self.publish(&state).await;
  }

  pub async fn snapshot(&self) -> SendingSnapshot {
    self.state.lock().await.snapshot()
  }
}

#[derive(Debug, Clone)]
pub struct ReceivingEntry {
  pub meta: Option<FileMeta>,
  pub progress: u64,
  pub exporter: Option<FileExporter>,
}

/// `peer -> file hash -> entry`.
#[derive(Debug, Clone, Default)]
pub struct ReceivingSnapshot {
  pub peers: BTreeMap<String, BTreeMap<String, ReceivingEntry>>,
}

#[derive(Default)]
struct ReceivingState {
  metas: BTreeMap<String, BTreeMap<String, FileMeta>>,
  progress: ProgressTable,
  cancelled: BTreeSet<FileKey>,
  exporters: BTreeMap<FileKey, FileExporter>,
}

impl ReceivingState {
  fn snapshot(&self) -> ReceivingSnapshot {
    let mut peers: BTreeMap<String, BTreeMap<String, ReceivingEntry>> = BTreeMap::new();
    let keys = self
      .metas
      .iter()
      .flat_map(|(peer_id, files)| files.keys().map(move |hash| FileKey::new(peer_id.as_str(), hash.as_str())))
      .chain(self.exporters.keys().cloned())
      .collect::<BTreeSet<_>>();
    for key in keys {
      let entry = ReceivingEntry {
        meta: self
          .metas
          .get(&key.peer_id)
          .and_then(|files| files.get(&key.file_hash))
          .cloned(),
        progress: self.progress.get(&key.peer_id, &key.file_hash),
        exporter: self.exporters.get(&key).cloned(),
      };
      peers.entry(key.peer_id).or_default().insert(key.file_hash, entry);
    }
    ReceivingSnapshot { peers }
  }
}

#[derive(Default)]
pub struct ReceivingTracker {
  state: Mutex<ReceivingState>,
  listener: Listener<ReceivingSnapshot>,
}

impl ReceivingTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ReceivingSnapshot> {
    self.listener.subscribe().await
  }

  async fn publish(&self, state: &ReceivingState) {
    self.listener.notify(state.snapshot()).await;
  }

  /// Merges, never replaces, what `peer_id` announced.
  pub async fn merge_meta(&self, peer_id: &str, files: BTreeMap<String, FileMeta>) {
    let mut state = self.state.lock().await;
    state.metas.entry(peer_id.to_string()).or_default().extend(files);
    self.publish(&state).await;
  }

  pub async fn meta(&self, key: &FileKey) -> Option<FileMeta> {
    let state = self.state.lock().await;
    state
      .metas
      .get(&key.peer_id)
      .and_then(|files| files.get(&key.file_hash))
      .cloned()
  }

  pub async fn progress(&self, key: &FileKey) -> u64 {
    self.state.lock().await.progress.get(&key.peer_id, &key.file_hash)
  }

  pub async fn add_progress(&self, key: &FileKey, delta: u64) -> u64 {
    let mut state = self.state.lock().await;
    let value = state.progress.add(&key.peer_id, &key.file_hash, delta);
    self.publish(&state).await;
    value
  }

  pub async fn reset_progress(&self, key: &FileKey) {
    let mut state = self.state.lock().await;
    state.progress.reset(&key.peer_id, &key.file_hash);
    self.publish(&state).await;
  }

  pub async fn is_cancelled(&self, key: &FileKey) -> bool {
    self.state.lock().await.cancelled.contains(key)
  }

  pub async fn set_cancelled(&self, key: &FileKey, cancelled: bool) {
    let mut state = self.state.lock().await;
    if cancelled {
      state.cancelled.insert(key.clone());
    } else {
      state.cancelled.remove(key);
    }
  }

  pub async fn register_exporter(&self, exporter: FileExporter) {
    let mut state = self.state.lock().await;
    state.exporters.insert(exporter.key().clone(), exporter);
    self.publish(&state).await;
  }

  pub async fn exporter(&self, key: &FileKey) -> Option<FileExporter> {
    self.state.lock().await.exporters.get(key).cloned()
  }

  pub async fn exporters(&self) -> Vec<FileExporter> {
    self.state.lock().await.exporters.values().cloned().collect()
  }

  pub async fn clear_exporters(&self) {
    let mut state = self.state.lock().await;
    state.exporters.clear();
    self.publish(&state).await;
  }

  pub async fn clear(&self) {
    let mut state = self.state.lock().await;
    *state = ReceivingState::default();
    self.publish(&state).await;
  }

  pub async fn snapshot(&self) -> ReceivingSnapshot {
    self.state.lock().await.snapshot()
  }
}
