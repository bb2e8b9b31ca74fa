//! In-memory loopback transport.
//!
//! Links model just enough of the signaling state machine for perfect
//! negotiation (offer, answer, implicit rollback). Channels created on a link
//! reach the remote link once the pair has completed a negotiation, and
//! every send reports an immediately drained buffer.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::track::track_local::TrackLocal;

use crate::transport::{
  ChannelEvent, ChannelHandle, ChannelMessage, ChannelState, Connector, DataChannel, PeerEvent, PeerLink, SdpType,
  SessionDescription, SignalingState, TrackKind,
};

#[derive(Default)]
struct NetworkInner {
  links: Mutex<HashMap<(String, String), Arc<FakeLink>>>,
  log: Mutex<Vec<String>>,
  max_message_size: AtomicUsize,
  hold_drains: AtomicBool,
  held_drains: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl NetworkInner {
  fn record(&self, entry: String) {
    self.log.lock().unwrap().push(entry);
  }
}

#[derive(Clone, Default)]
pub struct FakeNetwork {
  inner: Arc<NetworkInner>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Channels created afterwards report this negotiated message size.
  pub fn set_max_message_size(&self, size: usize) {
    self.inner.max_message_size.store(size, Ordering::SeqCst);
  }

  /// While held, a send does not report a drained buffer until
  /// `release_drains` is called.
  pub fn hold_drains(&self, hold: bool) {
    self.inner.hold_drains.store(hold, Ordering::SeqCst);
  }

  /// Reports every held drain; returns how many there were.
  pub fn release_drains(&self) -> usize {
    let held = std::mem::take(&mut *self.inner.held_drains.lock().unwrap());
    for own in &held {
      let _ = own.send(ChannelEvent::BufferedAmountLow);
    }
    held.len()
  }

  pub fn connector(&self, local_id: &str) -> Arc<dyn Connector> {
    Arc::new(FakeConnector {
      local_id: local_id.to_string(),
      network: self.inner.clone(),
    })
  }

  pub fn link(&self, local_id: &str, remote_id: &str) -> Option<Arc<FakeLink>> {
    self
      .inner
      .links
      .lock()
      .unwrap()
      .get(&(local_id.to_string(), remote_id.to_string()))
      .cloned()
  }

  pub fn candidates_applied(&self, local_id: &str, remote_id: &str) -> usize {
    self
      .link(local_id, remote_id)
      .map(|link| link.candidates.load(Ordering::SeqCst))
      .unwrap_or(0)
  }

  /// Marks both directions as negotiated without exchanging descriptions.
  pub fn establish(&self, a: &str, b: &str) {
    for (local, remote) in [(a, b), (b, a)] {
      if let Some(link) = self.link(local, remote) {
        link.mark_connected();
      }
    }
  }

  /// Channel lifecycle, text traffic and track control, in the order it
  /// happened: `open <label>`, `close <label>`, `text <label> <message>`,
  /// `binary <label> <len>`, `replace <a>-><b> <kind> on|off`,
  /// `sending <a>-><b> <kind> <bool>`.
  pub fn log(&self) -> Vec<String> {
    self.inner.log.lock().unwrap().clone()
  }

  pub fn count(&self, entry: &str) -> usize {
    self.log().iter().filter(|line| line.as_str() == entry).count()
  }
}

struct FakeConnector {
  local_id: String,
  network: Arc<NetworkInner>,
}

#[async_trait]
impl Connector for FakeConnector {
  async fn connect(&self, peer_id: &str) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<PeerEvent>)> {
    let (events, events_rx) = mpsc::unbounded_channel();
    let link = Arc::new(FakeLink {
      local_id: self.local_id.clone(),
      remote_id: peer_id.to_string(),
      network: Arc::downgrade(&self.network),
      state: Mutex::new(LinkState::default()),
      events,
      candidates: AtomicUsize::new(0),
    });
    self
      .network
      .links
      .lock()
      .unwrap()
      .insert((self.local_id.clone(), peer_id.to_string()), link.clone());
    Ok((link, events_rx))
  }
}

struct PendingChannel {
  local: Arc<FakeChannel>,
  remote: ChannelHandle,
}

struct LinkState {
  signaling: SignalingState,
  has_remote: bool,
  connected: bool,
  negotiation_requested: bool,
  seq: u32,
  pending: Vec<PendingChannel>,
  channels: Vec<Arc<FakeChannel>>,
}

impl Default for LinkState {
  fn default() -> Self {
    Self {
      signaling: SignalingState::Stable,
      has_remote: false,
      connected: false,
      negotiation_requested: false,
      seq: 0,
      pending: Vec::new(),
      channels: Vec::new(),
    }
  }
}

pub struct FakeLink {
  local_id: String,
  remote_id: String,
  network: Weak<NetworkInner>,
  state: Mutex<LinkState>,
  events: mpsc::UnboundedSender<PeerEvent>,
  candidates: AtomicUsize,
}

impl FakeLink {
  /// Raises `event` as if the transport had observed it.
  pub fn emit(&self, event: PeerEvent) {
    let _ = self.events.send(event);
  }

  fn record(&self, entry: String) {
    if let Some(network) = self.network.upgrade() {
      network.record(entry);
    }
  }

  fn mark_connected(&self) {
    let pending = {
      let mut state = self.state.lock().unwrap();
      state.signaling = SignalingState::Stable;
      state.has_remote = true;
      state.connected = true;
      state.negotiation_requested = false;
      std::mem::take(&mut state.pending)
    };
    self.deliver(pending);
  }

  fn deliver(&self, pending: Vec<PendingChannel>) {
    let Some(network) = self.network.upgrade() else {
      return;
    };
    let remote_link = network
      .links
      .lock()
      .unwrap()
      .get(&(self.remote_id.clone(), self.local_id.clone()))
      .cloned();
    for PendingChannel { local, remote } in pending {
      match remote_link.as_ref() {
        Some(remote_link) => {
          let _ = remote_link.events.send(PeerEvent::DataChannel(remote));
          local.open();
        }
        None => local.shut(),
      }
    }
  }

  fn describe(&self, kind: SdpType, seq: u32) -> SessionDescription {
    SessionDescription::new(kind, format!("{kind:?}:{}->{}:{seq}", self.local_id, self.remote_id))
  }
}

#[async_trait]
impl PeerLink for FakeLink {
  fn signaling_state(&self) -> SignalingState {
    self.state.lock().unwrap().signaling
  }

  async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
    let pending = {
      let mut state = self.state.lock().unwrap();
      match (desc.kind, state.signaling) {
        (_, SignalingState::Closed) => return Err(anyhow!("link closed")),
        (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
          state.signaling = SignalingState::HaveRemoteOffer;
          state.has_remote = true;
          Vec::new()
        }
        (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
          state.signaling = SignalingState::Stable;
          state.has_remote = true;
          state.connected = true;
          state.negotiation_requested = false;
          std::mem::take(&mut state.pending)
        }
        (kind, current) => return Err(anyhow!("cannot apply remote {kind:?} in {current:?}")),
      }
    };
    self.deliver(pending);
    Ok(())
  }

  async fn set_local_description(&self) -> Result<SessionDescription> {
    let (desc, pending) = {
      let mut state = self.state.lock().unwrap();
      state.seq += 1;
      let seq = state.seq;
      match state.signaling {
        SignalingState::HaveRemoteOffer => {
          state.signaling = SignalingState::Stable;
          state.connected = true;
          state.negotiation_requested = false;
          (self.describe(SdpType::Answer, seq), std::mem::take(&mut state.pending))
        }
        SignalingState::Stable | SignalingState::HaveLocalOffer => {
          state.signaling = SignalingState::HaveLocalOffer;
          (self.describe(SdpType::Offer, seq), Vec::new())
        }
        other => return Err(anyhow!("cannot create a local description in {other:?}")),
      }
    };
    self.deliver(pending);
    Ok(desc)
  }

  async fn add_ice_candidate(&self, _candidate: RTCIceCandidateInit) -> Result<()> {
    let state = self.state.lock().unwrap();
    if state.signaling == SignalingState::Closed || !state.has_remote {
      return Err(anyhow!("no remote description"));
    }
    self.candidates.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn create_channel(&self, label: &str) -> Result<ChannelHandle> {
    let network = self.network.upgrade().ok_or_else(|| anyhow!("network gone"))?;
    let max_message_size = network.max_message_size.load(Ordering::SeqCst);
    let (local_handle, local, remote) = FakeChannel::pair(label, max_message_size, Arc::downgrade(&network));

    let (deliver_now, request_negotiation) = {
      let mut state = self.state.lock().unwrap();
      if state.signaling == SignalingState::Closed {
        return Err(anyhow!("link closed"));
      }
      state.channels.push(local.clone());
      if state.connected {
        (Some(PendingChannel { local, remote }), false)
      } else {
        state.pending.push(PendingChannel { local, remote });
        let request = !state.negotiation_requested;
        state.negotiation_requested = true;
        (None, request)
      }
    };
    if let Some(pending) = deliver_now {
      self.deliver(vec![pending]);
    }
    if request_negotiation {
      let _ = self.events.send(PeerEvent::NegotiationNeeded);
    }
    Ok(local_handle)
  }

  async fn add_track(&self, _track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
    Ok(())
  }

  async fn remove_tracks(&self) -> Result<()> {
    Ok(())
  }

  async fn replace_tracks(&self, kind: TrackKind, track: Option<Arc<dyn TrackLocal + Send + Sync>>) -> Result<()> {
    let source = if track.is_some() { "on" } else { "off" };
    self.record(format!("replace {}->{} {kind} {source}", self.local_id, self.remote_id));
    Ok(())
  }

  async fn set_sending(&self, kind: TrackKind, sending: bool) -> Result<()> {
    self.record(format!("sending {}->{} {kind} {sending}", self.local_id, self.remote_id));
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    let channels = {
      let mut state = self.state.lock().unwrap();
      state.signaling = SignalingState::Closed;
      state.pending.clear();
      std::mem::take(&mut state.channels)
    };
    for channel in channels {
      channel.shut();
    }
    Ok(())
  }
}

pub struct FakeChannel {
  label: String,
  state: Arc<Mutex<ChannelState>>,
  own: mpsc::UnboundedSender<ChannelEvent>,
  peer: mpsc::UnboundedSender<ChannelEvent>,
  max_message_size: usize,
  network: Weak<NetworkInner>,
}

impl FakeChannel {
  /// Returns the local handle, the local end, and the remote handle.
  fn pair(
    label: &str,
    max_message_size: usize,
    network: Weak<NetworkInner>,
  ) -> (ChannelHandle, Arc<FakeChannel>, ChannelHandle) {
    let state = Arc::new(Mutex::new(ChannelState::Connecting));
    let (local_tx, local_rx) = mpsc::unbounded_channel();
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    let local = Arc::new(FakeChannel {
      label: label.to_string(),
      state: state.clone(),
      own: local_tx.clone(),
      peer: remote_tx.clone(),
      max_message_size,
      network: network.clone(),
    });
    let remote = Arc::new(FakeChannel {
      label: label.to_string(),
      state,
      own: remote_tx,
      peer: local_tx,
      max_message_size,
      network,
    });
    (
      ChannelHandle {
        channel: local.clone(),
        events: local_rx,
      },
      local,
      ChannelHandle {
        channel: remote,
        events: remote_rx,
      },
    )
  }

  fn record(&self, entry: String) {
    if let Some(network) = self.network.upgrade() {
      network.record(entry);
    }
  }

  fn open(&self) {
    *self.state.lock().unwrap() = ChannelState::Open;
    self.record(format!("open {}", self.label));
    let _ = self.own.send(ChannelEvent::Open);
    let _ = self.peer.send(ChannelEvent::Open);
  }

  fn shut(&self) {
    {
      let mut state = self.state.lock().unwrap();
      if *state == ChannelState::Closed {
        return;
      }
      *state = ChannelState::Closed;
    }
    self.record(format!("close {}", self.label));
    let _ = self.own.send(ChannelEvent::Close);
    let _ = self.peer.send(ChannelEvent::Close);
  }

  fn deliver(&self, message: ChannelMessage) -> Result<()> {
    if *self.state.lock().unwrap() != ChannelState::Open {
      return Err(anyhow!("channel {} is not open", self.label));
    }
    match &message {
      ChannelMessage::Text(text) => self.record(format!("text {} {text}", self.label)),
      ChannelMessage::Binary(data) => self.record(format!("binary {} {}", self.label, data.len())),
    }
    let _ = self.peer.send(ChannelEvent::Message(message));
    match self.network.upgrade() {
      Some(network) if network.hold_drains.load(Ordering::SeqCst) => {
        network.held_drains.lock().unwrap().push(self.own.clone());
      }
      _ => {
        let _ = self.own.send(ChannelEvent::BufferedAmountLow);
      }
    }
    Ok(())
  }
}

#[async_trait]
impl DataChannel for FakeChannel {
  fn label(&self) -> &str {
    &self.label
  }

  fn ready_state(&self) -> ChannelState {
    *self.state.lock().unwrap()
  }

  fn max_message_size(&self) -> usize {
    self.max_message_size
  }

  async fn send_text(&self, text: &str) -> Result<()> {
    self.deliver(ChannelMessage::Text(text.to_string()))
  }

  async fn send_binary(&self, data: Bytes) -> Result<()> {
    self.deliver(ChannelMessage::Binary(data))
  }

  async fn close(&self) -> Result<()> {
    self.shut();
    Ok(())
  }
}
