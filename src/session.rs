//! One room membership: every component wired to a single signaling connection.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use webrtc::track::track_local::TrackLocal;

use crate::chat::{ChatHub, ChatMessage};
use crate::listener::Listener;
use crate::media::{CallingInputType, MediaCalling, RemoteMedia};
use crate::negotiation::Negotiator;
use crate::progress::{ReceivingSnapshot, ReceivingTracker, SendingSnapshot, SendingTracker};
use crate::registry::{PeerRegistry, PeersInfo};
use crate::signaling::{ClientSignal, RoomInfo, ServerSignal, SignalSender};
use crate::store::{ChunkStore, FileExporter};
use crate::transfer::{ChannelPurpose, ContentHasher, FileReceiver, FileSender, SendFile, TransferOptions};
use crate::transport::{ChannelHandle, Connector, PeerEvent, TrackKind};

#[derive(Debug, Clone)]
pub enum SessionEvent {
  RoomsUpdated(serde_json::Value),
  JoinedRoom(RoomInfo),
  LeftRoom(RoomInfo),
  RemoteTrack {
    peer_id: String,
    kind: TrackKind,
    track_id: String,
  },
  PeerConnectionState {
    peer_id: String,
    state: String,
  },
  SignalingClosed,
}

pub struct Session {
  signal_tx: SignalSender,
  registry: Arc<PeerRegistry>,
  media: Arc<MediaCalling>,
  negotiator: Arc<Negotiator>,
  sender: Arc<FileSender>,
  receiver: Arc<FileReceiver>,
  chat: Arc<ChatHub>,
  peer_events: Mutex<Option<mpsc::UnboundedReceiver<(String, PeerEvent)>>>,
  events: Listener<SessionEvent>,
}

impl Session {
  pub fn new(
    options: TransferOptions,
    connector: Arc<dyn Connector>,
    store: Arc<dyn ChunkStore>,
    signal_tx: SignalSender,
  ) -> Arc<Self> {
    Self::with_hasher(options, connector, store, signal_tx, ContentHasher::for_today())
  }

  pub fn with_hasher(
    options: TransferOptions,
    connector: Arc<dyn Connector>,
    store: Arc<dyn ChunkStore>,
    signal_tx: SignalSender,
    hasher: ContentHasher,
  ) -> Arc<Self> {
    let registry = Arc::new(PeerRegistry::new(connector));
    let media = Arc::new(MediaCalling::new());
    let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
    let negotiator = Arc::new(Negotiator::new(
      registry.clone(),
      media.clone(),
      signal_tx.clone(),
      peer_events_tx,
    ));
    let sender = Arc::new(FileSender::new(
      registry.clone(),
      Arc::new(SendingTracker::new()),
      hasher,
      options,
    ));
    let receiver = Arc::new(FileReceiver::new(store, Arc::new(ReceivingTracker::new())));
    let chat = Arc::new(ChatHub::new(registry.clone()));
    Arc::new(Self {
      signal_tx,
      registry,
      media,
      negotiator,
      sender,
      receiver,
      chat,
      peer_events: Mutex::new(Some(peer_events)),
      events: Listener::default(),
    })
  }

  /// Serves signaling and peer events until the signaling stream ends.
  pub async fn run(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<ServerSignal>) -> Result<()> {
    let mut peer_events = self
      .peer_events
      .lock()
      .await
      .take()
      .ok_or_else(|| anyhow!("session is already running"))?;

    loop {
      tokio::select! {
        signal = incoming.recv() => match signal {
          Some(signal) => self.handle_signal(signal).await,
          None => {
            info!(event = "session_signaling_ended");
            self.events.notify(SessionEvent::SignalingClosed).await;
            break;
          }
        },
        Some((peer_id, event)) = peer_events.recv() => self.handle_peer_event(peer_id, event).await,
      }
    }
    Ok(())
  }

  async fn handle_signal(self: &Arc<Self>, signal: ServerSignal) {
    match signal {
      ServerSignal::Ping => {
        let _ = self.signal_tx.send(ClientSignal::Pong);
      }
      ServerSignal::UpdateRooms(rooms) => self.events.notify(SessionEvent::RoomsUpdated(rooms)).await,
      ServerSignal::JoinRoomSuccess(room) => {
        info!(event = "room_joined", room_id = ?room.room_id, room_name = ?room.room_name);
        self.events.notify(SessionEvent::JoinedRoom(room)).await;
      }
      ServerSignal::LeaveRoomSuccess(room) => {
        info!(event = "room_left", room_id = ?room.room_id);
        self.events.notify(SessionEvent::LeftRoom(room)).await;
      }
      ServerSignal::PeerArrival(arrival) => self.negotiator.handle_peer_arrival(&arrival).await,
      ServerSignal::Passthrough(passthrough) => self.negotiator.handle_passthrough(passthrough).await,
      ServerSignal::PeerLeave(leave) => {
        info!(event = "peer_left", peer_id = %leave.user_id);
        self.negotiator.handle_peer_leave(&leave.user_id).await;
        self.sender.remove_peer(&leave.user_id).await;
        self.chat.remove_peer(&leave.user_id).await;
        self.media.remove_peer_media(&leave.user_id).await;
      }
    }
  }

  async fn handle_peer_event(self: &Arc<Self>, peer_id: String, event: PeerEvent) {
    match event {
      PeerEvent::NegotiationNeeded => {
        let negotiator = self.negotiator.clone();
        tokio::spawn(async move { negotiator.handle_negotiation_needed(&peer_id).await });
      }
      PeerEvent::IceCandidate(candidate) => self.negotiator.handle_local_candidate(&peer_id, candidate),
      PeerEvent::DataChannel(handle) => self.dispatch_channel(peer_id, handle).await,
      PeerEvent::RemoteTrack { kind, track_id } => {
        info!(event = "remote_track", peer_id = %peer_id, kind = %kind);
        self.media.handle_remote_track(&peer_id, kind, track_id.clone()).await;
        self
          .events
          .notify(SessionEvent::RemoteTrack {
            peer_id,
            kind,
            track_id,
          })
          .await;
      }
      PeerEvent::RemoteTrackMuted { kind, track_id } => {
        debug!(event = "remote_track_muted", peer_id = %peer_id, kind = %kind, track_id = %track_id);
        let screen_sharing = self.is_screen_sharing(&peer_id).await;
        self.media.handle_remote_track_muted(&peer_id, kind, screen_sharing).await;
      }
      PeerEvent::RemoteTrackUnmuted { kind, track_id } => {
        debug!(event = "remote_track_unmuted", peer_id = %peer_id, kind = %kind);
        self.media.handle_remote_track_unmuted(&peer_id, kind, track_id).await;
      }
      PeerEvent::ConnectionState(state) => {
        debug!(event = "peer_connection_state", peer_id = %peer_id, state = %state);
        if matches!(state.as_str(), "failed" | "closed") {
          self.media.remove_peer_media(&peer_id).await;
        }
        self
          .events
          .notify(SessionEvent::PeerConnectionState { peer_id, state })
          .await;
      }
    }
  }

  async fn is_screen_sharing(&self, peer_id: &str) -> bool {
    let Some(transport) = self.registry.get(peer_id).await else {
      return false;
    };
    let constraints = *transport.remote_constraints.lock().await;
    constraints.is_some_and(|constraints| constraints.wants(CallingInputType::ScreenVideo))
  }

  async fn dispatch_channel(self: &Arc<Self>, peer_id: String, handle: ChannelHandle) {
    let label = handle.channel.label().to_string();
    debug!(event = "inbound_channel", peer_id = %peer_id, label = %label);
    match ChannelPurpose::from_label(&label) {
      ChannelPurpose::Chat => self.chat.attach(peer_id, handle).await,
      ChannelPurpose::FileMeta => {
        let receiver = self.receiver.clone();
        tokio::spawn(async move { receiver.handle_meta_channel(peer_id, handle).await });
      }
      ChannelPurpose::FileBuffer(file_hash) => {
        let receiver = self.receiver.clone();
        tokio::spawn(async move { receiver.handle_file_channel(peer_id, file_hash, handle).await });
      }
      ChannelPurpose::Unknown => {
        warn!(event = "unknown_channel_closed", peer_id = %peer_id, label = %label);
        let _ = handle.channel.close().await;
      }
    }
  }

  pub fn create_room(&self, room_name: &str) -> Result<()> {
    self.receiver.persist().reopen();
    self.send_signal(ClientSignal::CreateRoom {
      room_name: room_name.to_string(),
    })
  }

  pub fn join_room(&self, room_id: &str) -> Result<()> {
    self.receiver.persist().reopen();
    self.send_signal(ClientSignal::JoinRoom {
      room_id: room_id.to_string(),
    })
  }

  /// Tells the server and tears down every peer, transfer and received file.
  pub async fn leave_room(&self) -> Result<()> {
    self.send_signal(ClientSignal::LeaveRoom {})?;
    self.reset().await;
    Ok(())
  }

  async fn reset(&self) {
    if let Err(err) = self.media.hang_up(&self.registry).await {
      warn!(event = "hang_up_failed", error = %err);
    }
    self.media.clear_remote_media().await;
    self.sender.clear().await;
    self.chat.clear().await;
    self.negotiator.close_all().await;
    // Workers must be stopped before the store is emptied.
    self.receiver.persist().shutdown().await;
    self.receiver.clear_all_file_buffers_received().await;
    self.receiver.clear_all_files_received().await;
    self.receiver.tracker().clear().await;
    info!(event = "session_reset");
  }

  fn send_signal(&self, signal: ClientSignal) -> Result<()> {
    self
      .signal_tx
      .send(signal)
      .map_err(|_| anyhow!("signaling connection is closed"))
  }

  pub async fn send_chat(&self, text: &str) {
    self.chat.send_to_all(text).await;
  }

  /// Loads and sends `paths` to every peer, returning the batch's hashes.
  pub async fn send_files(&self, paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
      files.push(SendFile::load(path).await?);
    }
    Ok(self.sender.send_files(files).await)
  }

  pub async fn cancel_file(&self, file_hash: &str) {
    self.sender.cancel_file(file_hash).await;
  }

  pub async fn cancel_all(&self) {
    self.sender.cancel_all().await;
  }

  pub async fn clear_received_buffers(&self) {
    self.receiver.clear_all_file_buffers_received().await;
  }

  pub async fn clear_received_files(&self) {
    self.receiver.clear_all_files_received().await;
  }

  pub async fn received_files(&self) -> Vec<FileExporter> {
    self.receiver.tracker().exporters().await
  }

  pub async fn apply_calling_input_types(&self, inputs: &[CallingInputType]) {
    self.media.apply_calling_input_types(inputs).await;
  }

  pub async fn start_calling(&self, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) {
    self.media.start_calling(&self.registry, tracks).await;
  }

  pub async fn hang_up(&self) {
    if let Err(err) = self.media.hang_up(&self.registry).await {
      error!(event = "hang_up_failed", error = %err);
    }
  }

  pub async fn is_calling(&self) -> bool {
    self.media.is_calling().await
  }

  pub async fn set_local_track_enabled(&self, kind: TrackKind, enabled: bool) {
    self.media.set_local_track_enabled(&self.registry, kind, enabled).await;
  }

  pub async fn local_track_enabled(&self, kind: TrackKind) -> bool {
    self.media.local_track_enabled(kind).await
  }

  pub async fn set_local_track_muted(&self, kind: TrackKind, muted: bool) {
    self.media.set_local_track_muted(&self.registry, kind, muted).await;
  }

  pub async fn local_track_muted(&self, kind: TrackKind) -> bool {
    self.media.local_track_muted(kind).await
  }

  pub async fn remote_media(&self) -> RemoteMedia {
    self.media.remote_media().await
  }

  pub async fn peers_info(&self) -> PeersInfo {
    self.registry.peers_info().await
  }

  pub async fn sending(&self) -> SendingSnapshot {
    self.sender.tracker().snapshot().await
  }

  pub async fn receiving(&self) -> ReceivingSnapshot {
    self.receiver.tracker().snapshot().await
  }

  pub async fn subscribe_events(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
    self.events.subscribe().await
  }

  pub async fn subscribe_chat(&self) -> mpsc::UnboundedReceiver<ChatMessage> {
    self.chat.subscribe().await
  }

  pub async fn subscribe_calling_state(&self) -> mpsc::UnboundedReceiver<bool> {
    self.media.subscribe_calling_state().await
  }

  pub async fn subscribe_remote_media(&self) -> mpsc::UnboundedReceiver<RemoteMedia> {
    self.media.subscribe_remote_media().await
  }

  pub async fn subscribe_peers(&self) -> mpsc::UnboundedReceiver<PeersInfo> {
    self.registry.subscribe().await
  }

  pub async fn subscribe_sending(&self) -> mpsc::UnboundedReceiver<SendingSnapshot> {
    self.sender.tracker().subscribe().await
  }

  pub async fn subscribe_receiving(&self) -> mpsc::UnboundedReceiver<ReceivingSnapshot> {
    self.receiver.tracker().subscribe().await
  }
}
