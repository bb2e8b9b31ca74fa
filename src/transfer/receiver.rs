use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::persist::PersistScheduler;
use super::{
  FileMeta, ACK_FOR_END_OF_FILE_BUFFER_MESSAGE, ACK_FOR_FILE_META_DATA_MESSAGE, CANCEL_OF_FILE_BUFFER_MESSAGE,
  END_OF_FILE_BUFFER_MESSAGE, START_OF_FILE_BUFFER_MESSAGE,
};
use crate::progress::ReceivingTracker;
use crate::store::{ChunkStore, FileKey};
use crate::transport::{ChannelEvent, ChannelHandle, ChannelMessage};

/// Inbound side of the transfer protocol, one task per sub-channel.
pub struct FileReceiver {
  tracker: Arc<ReceivingTracker>,
  persist: Arc<PersistScheduler>,
}

impl FileReceiver {
  pub fn new(store: Arc<dyn ChunkStore>, tracker: Arc<ReceivingTracker>) -> Self {
    let persist = Arc::new(PersistScheduler::new(store, tracker.clone()));
    Self { tracker, persist }
  }

  pub fn tracker(&self) -> &Arc<ReceivingTracker> {
    &self.tracker
  }

  pub fn persist(&self) -> &Arc<PersistScheduler> {
    &self.persist
  }

  /// Merges every announced batch into the peer's meta data and acknowledges it.
  pub async fn handle_meta_channel(&self, peer_id: String, mut handle: ChannelHandle) {
    let channel = handle.channel.clone();
    while let Some(event) = handle.events.recv().await {
      if self.persist.is_closed() {
        break;
      }
      let text = match event {
        ChannelEvent::Message(ChannelMessage::Text(text)) => text,
        ChannelEvent::Message(ChannelMessage::Binary(_)) => {
          debug!(event = "meta_binary_dropped", peer_id = %peer_id);
          continue;
        }
        ChannelEvent::Close => break,
        ChannelEvent::Open | ChannelEvent::BufferedAmountLow => continue,
      };
      let files: BTreeMap<String, FileMeta> = match serde_json::from_str(&text) {
        Ok(files) => files,
        Err(err) => {
          warn!(event = "meta_parse_failed", peer_id = %peer_id, error = %err);
          continue;
        }
      };
      info!(event = "meta_received", peer_id = %peer_id, files = files.len());
      self.tracker.merge_meta(&peer_id, files).await;
      if let Err(err) = channel.send_text(ACK_FOR_FILE_META_DATA_MESSAGE).await {
        warn!(event = "meta_ack_failed", peer_id = %peer_id, error = %err);
      }
    }
  }

  /// Runs the per-file marker protocol until the channel closes.
  pub async fn handle_file_channel(&self, peer_id: String, file_hash: String, mut handle: ChannelHandle) {
    let key = FileKey::new(peer_id, file_hash);
    let channel = handle.channel.clone();
    let mut started = false;
    while let Some(event) = handle.events.recv().await {
      // Left the room; whatever is still buffered belongs to the old session.
      if self.persist.is_closed() {
        break;
      }
      match event {
        ChannelEvent::Message(ChannelMessage::Text(text)) => match text.as_str() {
          START_OF_FILE_BUFFER_MESSAGE => {
            self.tracker.set_cancelled(&key, false).await;
            self.persist.reset(&key).await;
            started = true;
            debug!(event = "file_started", key = %key);
          }
          CANCEL_OF_FILE_BUFFER_MESSAGE => {
            self.tracker.set_cancelled(&key, true).await;
            self.persist.reset(&key).await;
            info!(event = "file_cancelled_by_sender", key = %key);
          }
          END_OF_FILE_BUFFER_MESSAGE => {
            if let Err(err) = channel.send_text(ACK_FOR_END_OF_FILE_BUFFER_MESSAGE).await {
              warn!(event = "end_ack_failed", key = %key, error = %err);
            }
            self.persist.complete(&key).await;
          }
          other => debug!(event = "file_text_ignored", key = %key, text = %other),
        },
        ChannelEvent::Message(ChannelMessage::Binary(data)) => {
          if !started {
            debug!(event = "chunk_before_start_dropped", key = %key);
            continue;
          }
          if self.tracker.is_cancelled(&key).await {
            continue;
          }
          self.persist.append(&key, data).await;
        }
        ChannelEvent::Close => break,
        ChannelEvent::Open | ChannelEvent::BufferedAmountLow => {}
      }
    }
    debug!(event = "file_channel_closed", key = %key);
  }

  pub async fn clear_all_file_buffers_received(&self) {
    self.persist.clear_all_file_buffers_received().await;
  }

  pub async fn clear_all_files_received(&self) {
    self.persist.clear_all_files_received().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryChunkStore;
  use crate::transport::{ChannelState, DataChannel};
  use anyhow::Result;
  use async_trait::async_trait;
  use bytes::Bytes;
  use std::sync::Mutex;
  use tokio::sync::mpsc;

  /// Records what the receiver sends back.
  #[derive(Default)]
  struct Recorder {
    sent: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl DataChannel for Recorder {
    fn label(&self) -> &str {
      "recorder"
    }

    fn ready_state(&self) -> ChannelState {
      ChannelState::Open
    }

    fn max_message_size(&self) -> usize {
      0
    }

    async fn send_text(&self, text: &str) -> Result<()> {
      self.sent.lock().unwrap().push(text.to_string());
      Ok(())
    }

    async fn send_binary(&self, _data: Bytes) -> Result<()> {
      Ok(())
    }

    async fn close(&self) -> Result<()> {
      Ok(())
    }
  }

  fn channel() -> (Arc<Recorder>, mpsc::UnboundedSender<ChannelEvent>, ChannelHandle) {
    let recorder = Arc::new(Recorder::default());
    let (tx, events) = mpsc::unbounded_channel();
    let handle = ChannelHandle {
      channel: recorder.clone(),
      events,
    };
    (recorder, tx, handle)
  }

  fn text(value: &str) -> ChannelEvent {
    ChannelEvent::Message(ChannelMessage::Text(value.to_string()))
  }

  fn binary(value: &'static [u8]) -> ChannelEvent {
    ChannelEvent::Message(ChannelMessage::Binary(Bytes::from_static(value)))
  }

  fn receiver() -> (Arc<MemoryChunkStore>, FileReceiver) {
    let store = Arc::new(MemoryChunkStore::new());
    (store.clone(), FileReceiver::new(store, Arc::new(ReceivingTracker::new())))
  }

  #[tokio::test]
  async fn meta_is_merged_and_acknowledged() {
    let (_, receiver) = receiver();
    let (recorder, tx, handle) = channel();
    tx.send(text(r#"{"h1":{"name":"a.txt","type":"text/plain","size":3,"lastModified":7}}"#))
      .unwrap();
    tx.send(text("not json")).unwrap();
    tx.send(ChannelEvent::Close).unwrap();

    receiver.handle_meta_channel("p".to_string(), handle).await;
    let meta = receiver.tracker().meta(&FileKey::new("p", "h1")).await.unwrap();
    assert_eq!(meta.size, 3);
    assert_eq!(*recorder.sent.lock().unwrap(), vec![ACK_FOR_FILE_META_DATA_MESSAGE.to_string()]);
  }

  #[tokio::test]
  async fn file_protocol_persists_and_acknowledges_end() {
    let (store, receiver) = receiver();
    let key = FileKey::new("p", "h1");
    receiver
      .tracker()
      .merge_meta(
        "p",
        BTreeMap::from([(
          "h1".to_string(),
          FileMeta {
            name: "a.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 6,
            last_modified: 0,
          },
        )]),
      )
      .await;

    let (recorder, tx, handle) = channel();
    tx.send(binary(b"early")).unwrap();
    tx.send(text(START_OF_FILE_BUFFER_MESSAGE)).unwrap();
    tx.send(binary(b"abc")).unwrap();
    tx.send(binary(b"def")).unwrap();
    tx.send(text(END_OF_FILE_BUFFER_MESSAGE)).unwrap();
    tx.send(ChannelEvent::Close).unwrap();

    receiver.handle_file_channel("p".to_string(), "h1".to_string(), handle).await;
    receiver.persist().flush(&key).await;

    let file = receiver.tracker().exporter(&key).await.unwrap().export().await.unwrap();
    assert_eq!(file.data.as_ref(), b"abcdef");
    assert_eq!(store.chunk_count().await, 0);
    assert_eq!(
      *recorder.sent.lock().unwrap(),
      vec![ACK_FOR_END_OF_FILE_BUFFER_MESSAGE.to_string()]
    );
  }

  #[tokio::test]
  async fn cancel_marker_drops_later_chunks() {
    let (store, receiver) = receiver();
    let key = FileKey::new("p", "h1");
    let (_recorder, tx, handle) = channel();
    tx.send(text(START_OF_FILE_BUFFER_MESSAGE)).unwrap();
    tx.send(binary(b"abc")).unwrap();
    tx.send(text(CANCEL_OF_FILE_BUFFER_MESSAGE)).unwrap();
    tx.send(binary(b"def")).unwrap();
    tx.send(ChannelEvent::Close).unwrap();

    receiver.handle_file_channel("p".to_string(), "h1".to_string(), handle).await;
    receiver.persist().flush(&key).await;

    assert!(receiver.tracker().is_cancelled(&key).await);
    assert_eq!(receiver.tracker().progress(&key).await, 0);
    assert_eq!(store.chunk_count().await, 0);
  }

  #[tokio::test]
  async fn buffered_events_are_ignored_after_shutdown() {
    let (store, receiver) = receiver();
    let (recorder, tx, handle) = channel();
    receiver.persist().shutdown().await;
    tx.send(text(START_OF_FILE_BUFFER_MESSAGE)).unwrap();
    tx.send(binary(b"abc")).unwrap();
    tx.send(text(END_OF_FILE_BUFFER_MESSAGE)).unwrap();

    receiver.handle_file_channel("p".to_string(), "h1".to_string(), handle).await;
    assert_eq!(store.chunk_count().await, 0);
    assert!(recorder.sent.lock().unwrap().is_empty());
    assert!(receiver.tracker().snapshot().await.peers.is_empty());
  }
}
