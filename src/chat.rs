//! Text chat over one fixed-label sub-channel per peer.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::listener::Listener;
use crate::registry::PeerRegistry;
use crate::transfer::CHAT_MESSAGING_CHANNEL_LABEL;
use crate::transport::{ChannelEvent, ChannelHandle, ChannelMessage, ChannelState, DataChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
  pub peer_id: String,
  pub peer_name: Option<String>,
  pub text: String,
}

pub struct ChatHub {
  registry: Arc<PeerRegistry>,
  channels: Mutex<HashMap<String, Arc<dyn DataChannel>>>,
  /// Text written before the peer's channel opened.
  pending: Mutex<HashMap<String, Vec<String>>>,
  listener: Listener<ChatMessage>,
}

impl ChatHub {
  pub fn new(registry: Arc<PeerRegistry>) -> Self {
    Self {
      registry,
      channels: Mutex::new(HashMap::new()),
      pending: Mutex::new(HashMap::new()),
      listener: Listener::default(),
    }
  }

  pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ChatMessage> {
    self.listener.subscribe().await
  }

  /// Sends `text` to every peer, opening chat channels where none exist yet.
  pub async fn send_to_all(self: &Arc<Self>, text: &str) {
    if text.is_empty() {
      return;
    }
    for transport in self.registry.transports().await {
      let peer_id = transport.peer_id.clone();
      let existing = self.channels.lock().await.get(&peer_id).cloned();
      match existing {
        Some(channel) if channel.is_open() => {
          if let Err(err) = channel.send_text(text).await {
            warn!(event = "chat_send_failed", peer_id = %peer_id, error = %err);
          }
        }
        Some(channel) if channel.ready_state() == ChannelState::Connecting => {
          self.queue(&peer_id, text).await;
        }
        _ => {
          self.queue(&peer_id, text).await;
          match transport.link.create_channel(CHAT_MESSAGING_CHANNEL_LABEL).await {
            Ok(handle) => self.attach(peer_id, handle).await,
            Err(err) => warn!(event = "chat_channel_failed", peer_id = %peer_id, error = %err),
          }
        }
      }
    }
  }

  async fn queue(&self, peer_id: &str, text: &str) {
    self
      .pending
      .lock()
      .await
      .entry(peer_id.to_string())
      .or_default()
      .push(text.to_string());
  }

  /// Takes over a chat channel, whichever side opened it.
  pub async fn attach(self: &Arc<Self>, peer_id: String, handle: ChannelHandle) {
    let channel = handle.channel.clone();
    self.channels.lock().await.insert(peer_id.clone(), channel.clone());
    if channel.is_open() {
      self.flush(&peer_id, channel.as_ref()).await;
    }
    let hub = self.clone();
    tokio::spawn(async move { hub.drive(peer_id, handle).await });
  }

  async fn flush(&self, peer_id: &str, channel: &dyn DataChannel) {
    let queued = self.pending.lock().await.remove(peer_id).unwrap_or_default();
    for text in queued {
      if let Err(err) = channel.send_text(&text).await {
        warn!(event = "chat_send_failed", peer_id = %peer_id, error = %err);
      }
    }
  }

  async fn drive(&self, peer_id: String, mut handle: ChannelHandle) {
    let channel = handle.channel.clone();
    while let Some(event) = handle.events.recv().await {
      match event {
        ChannelEvent::Open => self.flush(&peer_id, channel.as_ref()).await,
        ChannelEvent::Message(ChannelMessage::Text(text)) => {
          let peer_name = self.registry.peer_name(&peer_id).await;
          info!(event = "chat_received", peer_id = %peer_id, bytes = text.len());
          self
            .listener
            .notify(ChatMessage {
              peer_id: peer_id.clone(),
              peer_name,
              text,
            })
            .await;
        }
        ChannelEvent::Message(ChannelMessage::Binary(_)) => {
          debug!(event = "chat_binary_dropped", peer_id = %peer_id);
        }
        ChannelEvent::BufferedAmountLow => {}
        ChannelEvent::Close => break,
      }
    }
    let mut channels = self.channels.lock().await;
    if channels
      .get(&peer_id)
      .is_some_and(|current| Arc::ptr_eq(current, &channel))
    {
      channels.remove(&peer_id);
    }
  }

  pub async fn remove_peer(&self, peer_id: &str) {
    self.channels.lock().await.remove(peer_id);
    self.pending.lock().await.remove(peer_id);
  }

  pub async fn clear(&self) {
    let channels: Vec<_> = self.channels.lock().await.drain().map(|(_, channel)| channel).collect();
    for channel in channels {
      let _ = channel.close().await;
    }
    self.pending.lock().await.clear();
  }
}
