//! Peer transport contract: one negotiable link per remote peer, and labeled
//! sub-channels opened over it.
//!
//! The engine only talks to these traits. `rtc` adapts webrtc-rs to them; the
//! test loopback in `test_util` implements them in memory.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

pub mod rtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
  Stable,
  HaveLocalOffer,
  HaveRemoteOffer,
  HaveLocalPranswer,
  HaveRemotePranswer,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
  Offer,
  Pranswer,
  Answer,
  Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
  #[serde(rename = "type")]
  pub kind: SdpType,
  pub sdp: String,
}

impl SessionDescription {
  pub fn new(kind: SdpType, sdp: impl Into<String>) -> Self {
    Self { kind, sdp: sdp.into() }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
  Audio,
  Video,
}

impl TrackKind {
  pub fn from_codec(codec: RTPCodecType) -> Option<Self> {
    match codec {
      RTPCodecType::Audio => Some(Self::Audio),
      RTPCodecType::Video => Some(Self::Video),
      RTPCodecType::Unspecified => None,
    }
  }
}

impl fmt::Display for TrackKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Audio => "audio",
      Self::Video => "video",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  Connecting,
  Open,
  Closing,
  Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
  Text(String),
  Binary(Bytes),
}

#[derive(Debug)]
pub enum ChannelEvent {
  Open,
  Message(ChannelMessage),
  /// Buffered bytes dropped to the channel's low-watermark threshold (0).
  BufferedAmountLow,
  Close,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
  fn label(&self) -> &str;
  fn ready_state(&self) -> ChannelState;
  /// Negotiated maximum message size, 0 when the transport reports none.
  fn max_message_size(&self) -> usize;
  async fn send_text(&self, text: &str) -> Result<()>;
  async fn send_binary(&self, data: Bytes) -> Result<()>;
  async fn close(&self) -> Result<()>;

  fn is_open(&self) -> bool {
    self.ready_state() == ChannelState::Open
  }
}

/// A sub-channel plus the ordered stream of everything that happens on it.
pub struct ChannelHandle {
  pub channel: Arc<dyn DataChannel>,
  pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

pub enum PeerEvent {
  NegotiationNeeded,
  IceCandidate(RTCIceCandidateInit),
  DataChannel(ChannelHandle),
  RemoteTrack { kind: TrackKind, track_id: String },
  /// The remote side stopped sending media on the track.
  RemoteTrackMuted { kind: TrackKind, track_id: String },
  RemoteTrackUnmuted { kind: TrackKind, track_id: String },
  ConnectionState(String),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
  fn signaling_state(&self) -> SignalingState;
  async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
  /// Implicit local description: an answer while holding a remote offer,
  /// otherwise a fresh offer. Returns what was applied.
  async fn set_local_description(&self) -> Result<SessionDescription>;
  async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
  async fn create_channel(&self, label: &str) -> Result<ChannelHandle>;
  async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()>;
  async fn remove_tracks(&self) -> Result<()>;
  /// Swaps the source of every sender of `kind` without renegotiating.
  /// `None` keeps the senders but stops them from emitting media.
  async fn replace_tracks(&self, kind: TrackKind, track: Option<Arc<dyn TrackLocal + Send + Sync>>) -> Result<()>;
  /// Flips the transceivers of `kind` between send-receive and receive-only.
  async fn set_sending(&self, kind: TrackKind, sending: bool) -> Result<()>;
  async fn close(&self) -> Result<()>;
}

/// Creates the link for a newly referenced peer, with its event stream.
#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self, peer_id: &str) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<PeerEvent>)>;
}
