use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::files::{ContentHasher, FileMeta, SendFile};
use super::{
  chunk_size_for, file_channel_label, ACK_FOR_END_OF_FILE_BUFFER_MESSAGE, ACK_FOR_FILE_META_DATA_MESSAGE,
  CANCEL_OF_FILE_BUFFER_MESSAGE, DEFAULT_CHUNK_SIZE, END_OF_FILE_BUFFER_MESSAGE, FILE_META_DATA_CHANNEL_LABEL,
  START_OF_FILE_BUFFER_MESSAGE,
};
use crate::progress::SendingTracker;
use crate::registry::PeerRegistry;
use crate::transport::{ChannelEvent, ChannelHandle, ChannelMessage, DataChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
  /// Chunk size when a channel reports no negotiated maximum.
  pub fallback_chunk_size: usize,
  pub chunk_size_ceiling: usize,
}

impl Default for TransferOptions {
  fn default() -> Self {
    Self {
      fallback_chunk_size: DEFAULT_CHUNK_SIZE,
      chunk_size_ceiling: 64 * 1024,
    }
  }
}

struct ActiveFile {
  file_hash: String,
  /// `None` until the file's channel has been created.
  channel: Option<Arc<dyn DataChannel>>,
}

#[derive(Default)]
struct PeerQueue {
  pending: VecDeque<String>,
  active: Option<ActiveFile>,
  /// A drain task owns this queue.
  running: bool,
}

/// Streams batches of files to every peer, one file at a time per peer.
pub struct FileSender {
  registry: Arc<PeerRegistry>,
  tracker: Arc<SendingTracker>,
  hasher: ContentHasher,
  options: TransferOptions,
  files: Mutex<HashMap<String, SendFile>>,
  batch: Mutex<Vec<String>>,
  queues: Mutex<HashMap<String, PeerQueue>>,
}

impl FileSender {
  pub fn new(
    registry: Arc<PeerRegistry>,
    tracker: Arc<SendingTracker>,
    hasher: ContentHasher,
    options: TransferOptions,
  ) -> Self {
    Self {
      registry,
      tracker,
      hasher,
      options,
      files: Mutex::new(HashMap::new()),
      batch: Mutex::new(Vec::new()),
      queues: Mutex::new(HashMap::new()),
    }
  }

  pub fn tracker(&self) -> &Arc<SendingTracker> {
    &self.tracker
  }

  /// Announces the batch to every current peer and queues its files behind
  /// whatever each peer is already receiving. Returns the batch's hashes.
  pub async fn send_files(self: &Arc<Self>, files: Vec<SendFile>) -> Vec<String> {
    let unique = self.hasher.unique_files(files);
    if unique.is_empty() {
      return Vec::new();
    }
    let hashes: Vec<String> = unique.iter().map(|(hash, _)| hash.clone()).collect();
    let metas: BTreeMap<String, FileMeta> = unique
      .iter()
      .map(|(hash, file)| (hash.clone(), file.meta.clone()))
      .collect();

    self.tracker.clear_cancelled().await;
    self.tracker.prepare_meta(&metas).await;
    self.files.lock().await.extend(unique);
    *self.batch.lock().await = hashes.clone();

    let peers = self.registry.peer_ids().await;
    info!(event = "batch_started", files = hashes.len(), peers = peers.len());
    for peer_id in peers {
      let sender = self.clone();
      let metas = metas.clone();
      let hashes = hashes.clone();
      tokio::spawn(async move { sender.announce(peer_id, metas, hashes).await });
    }
    hashes
  }

  /// Sends the batch's meta data on a dedicated channel, then queues the
  /// files once the peer acknowledges.
  async fn announce(self: Arc<Self>, peer_id: String, metas: BTreeMap<String, FileMeta>, hashes: Vec<String>) {
    let Some(transport) = self.registry.get(&peer_id).await else {
      return;
    };
    let payload = match serde_json::to_string(&metas) {
      Ok(payload) => payload,
      Err(err) => {
        error!(event = "meta_encode_failed", error = %err);
        return;
      }
    };
    let mut handle = match transport.link.create_channel(FILE_META_DATA_CHANNEL_LABEL).await {
      Ok(handle) => handle,
      Err(err) => {
        error!(event = "meta_channel_failed", peer_id = %peer_id, error = %err);
        return;
      }
    };

    while let Some(event) = handle.events.recv().await {
      match event {
        ChannelEvent::Open => {
          if let Err(err) = handle.channel.send_text(&payload).await {
            warn!(event = "meta_send_failed", peer_id = %peer_id, error = %err);
          }
        }
        ChannelEvent::Message(ChannelMessage::Text(text)) if text == ACK_FOR_FILE_META_DATA_MESSAGE => {
          let _ = handle.channel.close().await;
          debug!(event = "meta_acknowledged", peer_id = %peer_id);
          self.enqueue(&peer_id, hashes).await;
          return;
        }
        ChannelEvent::Close => {
          warn!(event = "meta_channel_closed_early", peer_id = %peer_id);
          return;
        }
        _ => {}
      }
    }
  }

  async fn enqueue(self: &Arc<Self>, peer_id: &str, hashes: Vec<String>) {
    let idle = {
      let mut queues = self.queues.lock().await;
      let queue = queues.entry(peer_id.to_string()).or_default();
      queue.pending.extend(hashes);
      !std::mem::replace(&mut queue.running, true)
    };
    if idle {
      let sender = self.clone();
      let peer_id = peer_id.to_string();
      tokio::spawn(async move { sender.drain_queue(&peer_id).await });
    }
  }

  /// Streams the peer's queued files back to back; the next file's channel
  /// is only opened once the previous one has closed.
  async fn drain_queue(&self, peer_id: &str) {
    loop {
      let file_hash = {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(peer_id) else {
          return;
        };
        match queue.pending.pop_front() {
          Some(file_hash) => {
            queue.active = Some(ActiveFile {
              file_hash: file_hash.clone(),
              channel: None,
            });
            file_hash
          }
          None => {
            queue.active = None;
            queue.running = false;
            return;
          }
        }
      };

      if self.tracker.is_cancelled(&file_hash).await {
        debug!(event = "cancelled_file_skipped", peer_id = %peer_id, file_hash = %file_hash);
        continue;
      }
      match self.open_file_channel(peer_id, &file_hash).await {
        Ok((file, handle)) => self.stream_file(peer_id, &file_hash, &file, handle).await,
        Err(err) => error!(event = "file_channel_failed", peer_id = %peer_id, file_hash = %file_hash, error = %err),
      }
    }
  }

  async fn open_file_channel(&self, peer_id: &str, file_hash: &str) -> Result<(SendFile, ChannelHandle)> {
    let transport = self
      .registry
      .get(peer_id)
      .await
      .ok_or_else(|| anyhow!("peer {peer_id} is gone"))?;
    let file = self
      .files
      .lock()
      .await
      .get(file_hash)
      .cloned()
      .ok_or_else(|| anyhow!("no file queued for {file_hash}"))?;

    self.tracker.reset_progress(peer_id, file_hash).await;
    let handle = transport.link.create_channel(&file_channel_label(file_hash)).await?;
    if let Some(queue) = self.queues.lock().await.get_mut(peer_id) {
      if let Some(active) = queue.active.as_mut().filter(|active| active.file_hash == file_hash) {
        active.channel = Some(handle.channel.clone());
      }
    }
    Ok((file, handle))
  }

  /// Drives one file channel until it closes; each drained-buffer signal
  /// sends the next chunk.
  async fn stream_file(&self, peer_id: &str, file_hash: &str, file: &SendFile, mut handle: ChannelHandle) {
    let channel = handle.channel.clone();
    let chunk_size = chunk_size_for(
      channel.max_message_size(),
      self.options.fallback_chunk_size,
      self.options.chunk_size_ceiling,
    );
    let mut has_sent_end = false;

    while let Some(event) = handle.events.recv().await {
      match event {
        ChannelEvent::Open => {
          // Cancelled before the channel was registered as active.
          if self.tracker.is_cancelled(file_hash).await {
            self.abort(peer_id, file_hash, channel.as_ref()).await;
            continue;
          }
          debug!(event = "file_channel_opened", peer_id = %peer_id, file_hash = %file_hash, chunk_size);
          if let Err(err) = channel.send_text(START_OF_FILE_BUFFER_MESSAGE).await {
            warn!(event = "start_marker_failed", peer_id = %peer_id, error = %err);
          }
        }
        ChannelEvent::BufferedAmountLow => {
          if has_sent_end || !channel.is_open() {
            continue;
          }
          let offset = self.tracker.progress(peer_id, file_hash).await;
          if offset >= file.meta.size {
            has_sent_end = true;
            if let Err(err) = channel.send_text(END_OF_FILE_BUFFER_MESSAGE).await {
              warn!(event = "end_marker_failed", peer_id = %peer_id, error = %err);
            }
            continue;
          }
          if self.tracker.is_cancelled(file_hash).await {
            continue;
          }
          let chunk = match file.read_chunk(offset, chunk_size).await {
            Ok(chunk) => chunk,
            Err(err) => {
              error!(event = "file_read_failed", path = %file.path.display(), offset, error = %err);
              let _ = channel.close().await;
              continue;
            }
          };
          if chunk.is_empty() {
            warn!(event = "file_shorter_than_announced", path = %file.path.display(), offset);
            has_sent_end = true;
            let _ = channel.send_text(END_OF_FILE_BUFFER_MESSAGE).await;
            continue;
          }
          let len = chunk.len() as u64;
          if let Err(err) = channel.send_binary(chunk).await {
            warn!(event = "chunk_send_failed", peer_id = %peer_id, offset, error = %err);
            continue;
          }
          if !self.tracker.is_cancelled(file_hash).await {
            self.tracker.set_progress(peer_id, file_hash, offset + len).await;
          }
        }
        ChannelEvent::Message(ChannelMessage::Text(text)) if text == ACK_FOR_END_OF_FILE_BUFFER_MESSAGE => {
          info!(event = "file_sent", peer_id = %peer_id, file_hash = %file_hash, bytes = file.meta.size);
          let _ = channel.close().await;
        }
        ChannelEvent::Message(_) => {}
        ChannelEvent::Close => break,
      }
    }
  }

  async fn abort(&self, peer_id: &str, file_hash: &str, channel: &dyn DataChannel) {
    self.tracker.reset_progress(peer_id, file_hash).await;
    if let Err(err) = channel.send_text(CANCEL_OF_FILE_BUFFER_MESSAGE).await {
      warn!(event = "cancel_marker_failed", peer_id = %peer_id, error = %err);
    }
    let _ = channel.close().await;
  }

  /// Flags the file cancelled and tears down its open channels. Repeated
  /// calls find the channels already closed and send nothing more.
  pub async fn cancel_file(&self, file_hash: &str) {
    self.tracker.set_cancelled(file_hash).await;
    let streaming: Vec<(String, Arc<dyn DataChannel>)> = self
      .queues
      .lock()
      .await
      .iter()
      .filter_map(|(peer_id, queue)| {
        let active = queue.active.as_ref()?;
        let channel = active.channel.clone()?;
        (active.file_hash == file_hash).then(|| (peer_id.clone(), channel))
      })
      .collect();

    for (peer_id, channel) in streaming {
      if !channel.is_open() {
        continue;
      }
      self.abort(&peer_id, file_hash, channel.as_ref()).await;
    }
    info!(event = "file_send_cancelled", file_hash = %file_hash);
  }

  pub async fn cancel_all(&self) {
    let batch = self.batch.lock().await.clone();
    for file_hash in batch {
      self.cancel_file(&file_hash).await;
    }
  }

  /// Forgets a departed peer's queue and progress.
  pub async fn remove_peer(&self, peer_id: &str) {
    self.queues.lock().await.remove(peer_id);
    self.tracker.remove_peer(peer_id).await;
  }

  /// Cancels everything and drops all batch state.
  pub async fn clear(&self) {
    self.cancel_all().await;
    self.queues.lock().await.clear();
    self.files.lock().await.clear();
    self.batch.lock().await.clear();
    self.tracker.clear().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::progress::ReceivingTracker;
  use crate::store::{FileKey, MemoryChunkStore};
  use crate::test_util::FakeNetwork;
  use crate::transfer::{ChannelPurpose, FileReceiver};
  use crate::transport::PeerEvent;
  use std::path::PathBuf;
  use std::time::Duration;
  use tempfile::TempDir;
  use tokio::sync::mpsc;
  use tokio::time::timeout;

  struct Pair {
    network: FakeNetwork,
    sender: Arc<FileSender>,
    b_events: mpsc::UnboundedReceiver<PeerEvent>,
    _a_events: mpsc::UnboundedReceiver<PeerEvent>,
  }

  async fn pair() -> Pair {
    let network = FakeNetwork::new();
    let registry_a = Arc::new(PeerRegistry::new(network.connector("a")));
    let registry_b = PeerRegistry::new(network.connector("b"));
    let a_events = registry_a.locate("b", None).await.unwrap().created.unwrap().events;
    let b_events = registry_b.locate("a", None).await.unwrap().created.unwrap().events;
    network.establish("a", "b");

    let sender = Arc::new(FileSender::new(
      registry_a,
      Arc::new(SendingTracker::new()),
      ContentHasher::with_stamp(0),
      TransferOptions::default(),
    ));
    Pair {
      network,
      sender,
      b_events,
      _a_events: a_events,
    }
  }

  /// Answers on "b" with a full receiver until the event stream ends.
  fn spawn_receiver(mut events: mpsc::UnboundedReceiver<PeerEvent>) -> Arc<FileReceiver> {
    let receiver = Arc::new(FileReceiver::new(
      Arc::new(MemoryChunkStore::new()),
      Arc::new(ReceivingTracker::new()),
    ));
    let dispatch = receiver.clone();
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        let PeerEvent::DataChannel(handle) = event else {
          continue;
        };
        let receiver = dispatch.clone();
        match ChannelPurpose::from_label(handle.channel.label()) {
          ChannelPurpose::FileMeta => {
            tokio::spawn(async move { receiver.handle_meta_channel("a".to_string(), handle).await });
          }
          ChannelPurpose::FileBuffer(hash) => {
            tokio::spawn(async move { receiver.handle_file_channel("a".to_string(), hash, handle).await });
          }
          _ => {}
        }
      }
    });
    receiver
  }

  fn write_file(dir: &TempDir, name: &str, len: usize) -> PathBuf {
    let path = dir.path().join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
  }

  async fn wait_for_files(receiver: &FileReceiver, count: usize) {
    timeout(Duration::from_secs(5), async {
      while receiver.tracker().exporters().await.len() < count {
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
    .await
    .expect("files were not received in time");
  }

  #[tokio::test]
  async fn file_arrives_intact_in_chunks() {
    let mut pair = pair().await;
    pair.network.set_max_message_size(16384);
    let receiver = spawn_receiver(std::mem::replace(&mut pair.b_events, mpsc::unbounded_channel().1));
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "report.pdf", 40_000);

    let hashes = pair
      .sender
      .send_files(vec![SendFile::load(&path).await.unwrap()])
      .await;
    wait_for_files(&receiver, 1).await;

    let key = FileKey::new("a", hashes[0].as_str());
    let file = receiver.tracker().exporter(&key).await.unwrap().export().await.unwrap();
    assert_eq!(file.data.as_ref(), std::fs::read(&path).unwrap().as_slice());
    assert_eq!(file.meta.name, "report.pdf");
    timeout(Duration::from_secs(5), async {
      while pair.sender.tracker().min_progress(&hashes[0]).await < 40_000 {
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
    .await
    .unwrap();
    assert!(!pair.sender.tracker().is_sending().await);
  }

  #[tokio::test]
  async fn files_stream_one_at_a_time_per_peer() {
    let mut pair = pair().await;
    let receiver = spawn_receiver(std::mem::replace(&mut pair.b_events, mpsc::unbounded_channel().1));
    let dir = TempDir::new().unwrap();
    let first = SendFile::load(&write_file(&dir, "one.bin", 20_000)).await.unwrap();
    let second = SendFile::load(&write_file(&dir, "two.bin", 100)).await.unwrap();

    let hashes = pair.sender.send_files(vec![first, second]).await;
    wait_for_files(&receiver, 2).await;

    let log = pair.network.log();
    let position = |entry: String| log.iter().position(|line| *line == entry).unwrap();
    let first_closed = position(format!("close {}", file_channel_label(&hashes[0])));
    let second_opened = position(format!("open {}", file_channel_label(&hashes[1])));
    assert!(first_closed < second_opened);
  }

  #[tokio::test]
  async fn duplicate_files_are_sent_once() {
    let pair = pair().await;
    let dir = TempDir::new().unwrap();
    let file = SendFile::load(&write_file(&dir, "same.txt", 10)).await.unwrap();
    let hashes = pair.sender.send_files(vec![file.clone(), file]).await;
    assert_eq!(hashes.len(), 1);
    assert!(pair.sender.tracker().check_prepared(hashes.iter()).await);
  }

  #[tokio::test]
  async fn cancelling_twice_sends_one_marker() {
    let mut pair = pair().await;
    // "b" acknowledges the meta data but never the end marker, so the file
    // channel stays open.
    let mut b_events = std::mem::replace(&mut pair.b_events, mpsc::unbounded_channel().1);
    tokio::spawn(async move {
      let mut held = Vec::new();
      while let Some(event) = b_events.recv().await {
        let PeerEvent::DataChannel(mut handle) = event else {
          continue;
        };
        if handle.channel.label() == FILE_META_DATA_CHANNEL_LABEL {
          tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
              if let ChannelEvent::Message(ChannelMessage::Text(_)) = event {
                let _ = handle.channel.send_text(ACK_FOR_FILE_META_DATA_MESSAGE).await;
              }
            }
          });
        } else {
          held.push(handle);
        }
      }
    });

    let dir = TempDir::new().unwrap();
    let file = SendFile::load(&write_file(&dir, "slow.bin", 10)).await.unwrap();
    let hashes = pair.sender.send_files(vec![file]).await;
    let label = file_channel_label(&hashes[0]);
    let end_sent = format!("text {label} {END_OF_FILE_BUFFER_MESSAGE}");
    timeout(Duration::from_secs(5), async {
      while pair.network.count(&end_sent) == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
    .await
    .unwrap();

    pair.sender.cancel_file(&hashes[0]).await;
    pair.sender.cancel_file(&hashes[0]).await;

    let cancel_sent = format!("text {label} {CANCEL_OF_FILE_BUFFER_MESSAGE}");
    assert_eq!(pair.network.count(&cancel_sent), 1);
    assert_eq!(pair.network.count(&format!("close {label}")), 1);
    assert!(pair.sender.tracker().is_cancelled(&hashes[0]).await);
    assert_eq!(pair.sender.tracker().progress("b", &hashes[0]).await, 0);
  }

  fn entries_starting(network: &FakeNetwork, prefix: &str) -> usize {
    network.log().iter().filter(|line| line.starts_with(prefix)).count()
  }

  #[tokio::test]
  async fn cancel_flag_stops_chunks_mid_stream() {
    let mut pair = pair().await;
    pair.network.set_max_message_size(1000);
    pair.network.hold_drains(true);
    let _receiver = spawn_receiver(std::mem::replace(&mut pair.b_events, mpsc::unbounded_channel().1));
    let dir = TempDir::new().unwrap();
    let file = SendFile::load(&write_file(&dir, "big.bin", 10_000)).await.unwrap();

    let hashes = pair.sender.send_files(vec![file]).await;
    let label = file_channel_label(&hashes[0]);
    let chunks = format!("binary {label} ");
    timeout(Duration::from_secs(5), async {
      while entries_starting(&pair.network, &chunks) == 0 {
        pair.network.release_drains();
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let sent = entries_starting(&pair.network, &chunks);
    assert!(sent < 10);

    pair.sender.tracker().set_cancelled(&hashes[0]).await;
    for _ in 0..5 {
      pair.network.release_drains();
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(entries_starting(&pair.network, &chunks), sent);
    assert_eq!(
      pair
        .network
        .count(&format!("text {label} {END_OF_FILE_BUFFER_MESSAGE}")),
      0
    );
  }

  #[tokio::test]
  async fn queued_file_cancelled_before_its_turn_is_skipped() {
    let mut pair = pair().await;
    pair.network.hold_drains(true);
    let receiver = spawn_receiver(std::mem::replace(&mut pair.b_events, mpsc::unbounded_channel().1));
    let dir = TempDir::new().unwrap();
    let first = SendFile::load(&write_file(&dir, "first.bin", 5_000)).await.unwrap();
    let second = SendFile::load(&write_file(&dir, "second.bin", 100)).await.unwrap();

    let hashes = pair.sender.send_files(vec![first, second]).await;
    let first_label = file_channel_label(&hashes[0]);
    let second_label = file_channel_label(&hashes[1]);
    timeout(Duration::from_secs(5), async {
      while pair.network.count(&format!("open {first_label}")) == 0 {
        pair.network.release_drains();
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
    .await
    .unwrap();

    pair.sender.cancel_file(&hashes[1]).await;
    pair.network.hold_drains(false);
    timeout(Duration::from_secs(5), async {
      while receiver.tracker().exporters().await.is_empty() || pair.network.count(&format!("close {first_label}")) == 0
      {
        pair.network.release_drains();
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pair.network.count(&format!("open {second_label}")), 0);
    assert_eq!(receiver.tracker().exporters().await.len(), 1);
    assert!(pair.sender.tracker().is_cancelled(&hashes[1]).await);
  }
}
