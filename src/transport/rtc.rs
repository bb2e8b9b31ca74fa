//! webrtc-rs backed implementation of the transport contract.

use super::{
  ChannelEvent, ChannelHandle, ChannelMessage, ChannelState, Connector, DataChannel, PeerEvent, PeerLink, SdpType,
  SessionDescription, SignalingState, TrackKind,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::sctp_transport::RTCSctpTransport;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub struct RtcConnector {
  api: API,
  ice_servers: Vec<String>,
}

impl RtcConnector {
  pub fn new(ice_servers: Vec<String>) -> Result<Self> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
      .with_media_engine(media_engine)
      .with_interceptor_registry(registry)
      .build();
    Ok(Self { api, ice_servers })
  }

  fn configuration(&self) -> RTCConfiguration {
    RTCConfiguration {
      ice_servers: vec![RTCIceServer {
        urls: self.ice_servers.clone(),
        ..Default::default()
      }],
      ..Default::default()
    }
  }
}

#[async_trait]
impl Connector for RtcConnector {
  async fn connect(&self, peer_id: &str) -> Result<(Arc<dyn PeerLink>, mpsc::UnboundedReceiver<PeerEvent>)> {
    let pc = Arc::new(
      self
        .api
        .new_peer_connection(self.configuration())
        .await
        .with_context(|| format!("create peer connection for {peer_id}"))?,
    );
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    wire_peer_events(&pc, peer_id, events_tx);
    Ok((Arc::new(RtcPeerLink { pc }), events_rx))
  }
}

fn wire_peer_events(pc: &Arc<RTCPeerConnection>, peer_id: &str, tx: mpsc::UnboundedSender<PeerEvent>) {
  let negotiation_tx = tx.clone();
  pc.on_negotiation_needed(Box::new(move || {
    let tx = negotiation_tx.clone();
    Box::pin(async move {
      let _ = tx.send(PeerEvent::NegotiationNeeded);
    })
  }));

  let ice_tx = tx.clone();
  pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
    let tx = ice_tx.clone();
    Box::pin(async move {
      if let Some(candidate) = candidate {
        let candidate = candidate.to_json().unwrap_or_default();
        let _ = tx.send(PeerEvent::IceCandidate(candidate));
      }
    })
  }));

  let channel_tx = tx.clone();
  let sctp = pc.sctp();
  pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
    let tx = channel_tx.clone();
    let sctp = sctp.clone();
    Box::pin(async move {
      let handle = wrap_channel(dc, max_message_size(&sctp)).await;
      let _ = tx.send(PeerEvent::DataChannel(handle));
    })
  }));

  let track_tx = tx.clone();
  pc.on_track(Box::new(
    move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
      let tx = track_tx.clone();
      Box::pin(async move {
        let Some(kind) = TrackKind::from_codec(track.kind()) else {
          return;
        };
        let track_id = track.id();

        let mute_tx = tx.clone();
        let mute_id = track_id.clone();
        track.onmute(move || {
          let tx = mute_tx.clone();
          let track_id = mute_id.clone();
          Box::pin(async move {
            let _ = tx.send(PeerEvent::RemoteTrackMuted { kind, track_id });
          })
        });
        let unmute_tx = tx.clone();
        let unmute_id = track_id.clone();
        track.onunmute(move || {
          let tx = unmute_tx.clone();
          let track_id = unmute_id.clone();
          Box::pin(async move {
            let _ = tx.send(PeerEvent::RemoteTrackUnmuted { kind, track_id });
          })
        });

        let _ = tx.send(PeerEvent::RemoteTrack { kind, track_id });
      })
    },
  ));

  let state_tx = tx;
  let peer_id = peer_id.to_string();
  pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
    let tx = state_tx.clone();
    let peer_id = peer_id.clone();
    Box::pin(async move {
      debug!(event = "connection_state", peer_id = %peer_id, state = %state);
      let _ = tx.send(PeerEvent::ConnectionState(state.to_string()));
    })
  }));
}

fn max_message_size(sctp: &RTCSctpTransport) -> usize {
  sctp.get_capabilities().max_message_size as usize
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
  let value = serde_json::to_value(desc)?;
  serde_json::from_value(value).context("convert session description")
}

fn from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription> {
  let value = serde_json::to_value(desc)?;
  serde_json::from_value(value).context("convert session description")
}

pub struct RtcPeerLink {
  pc: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
  /// Drops a pending local offer so a remote offer can be applied.
  async fn rollback(&self) -> Result<()> {
    let pending = self
      .pc
      .pending_local_description()
      .await
      .ok_or_else(|| anyhow!("no pending local offer to roll back"))?;
    let rollback = to_rtc(&SessionDescription::new(SdpType::Rollback, pending.sdp))?;
    self.pc.set_local_description(rollback).await.context("rollback local offer")?;
    Ok(())
  }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
  fn signaling_state(&self) -> SignalingState {
    match self.pc.signaling_state() {
      RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
      RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
      RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
      RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
      RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
      RTCSignalingState::Closed => SignalingState::Closed,
    }
  }

  async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
    if desc.kind == SdpType::Offer && self.signaling_state() == SignalingState::HaveLocalOffer {
      self.rollback().await?;
    }
    self
      .pc
      .set_remote_description(to_rtc(&desc)?)
      .await
      .context("set remote description")?;
    Ok(())
  }

  async fn set_local_description(&self) -> Result<SessionDescription> {
    let desc = match self.signaling_state() {
      SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => self.pc.create_answer(None).await?,
      _ => self.pc.create_offer(None).await?,
    };
    self.pc.set_local_description(desc).await.context("set local description")?;
    let local = self
      .pc
      .local_description()
      .await
      .ok_or_else(|| anyhow!("local description missing after apply"))?;
    from_rtc(&local)
  }

  async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
    self.pc.add_ice_candidate(candidate).await?;
    Ok(())
  }

  async fn create_channel(&self, label: &str) -> Result<ChannelHandle> {
    let dc = self
      .pc
      .create_data_channel(
        label,
        Some(RTCDataChannelInit {
          ordered: Some(true),
          ..Default::default()
        }),
      )
      .await
      .with_context(|| format!("create data channel {label}"))?;
    Ok(wrap_channel(dc, max_message_size(&self.pc.sctp())).await)
  }

  async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
    self.pc.add_track(track).await?;
    Ok(())
  }

  async fn remove_tracks(&self) -> Result<()> {
    for sender in self.pc.get_senders().await {
      if sender.track().await.is_none() {
        continue;
      }
      if let Err(err) = self.pc.remove_track(&sender).await {
        warn!(event = "remove_track_failed", error = %err);
      }
    }
    Ok(())
  }

  async fn replace_tracks(&self, kind: TrackKind, track: Option<Arc<dyn TrackLocal + Send + Sync>>) -> Result<()> {
    for transceiver in self.pc.get_transceivers().await {
      if TrackKind::from_codec(transceiver.kind()) != Some(kind) {
        continue;
      }
      transceiver
        .sender()
        .await
        .replace_track(track.clone())
        .await
        .with_context(|| format!("replace {kind} track"))?;
    }
    Ok(())
  }

  async fn set_sending(&self, kind: TrackKind, sending: bool) -> Result<()> {
    let direction = if sending {
      RTCRtpTransceiverDirection::Sendrecv
    } else {
      RTCRtpTransceiverDirection::Recvonly
    };
    for transceiver in self.pc.get_transceivers().await {
      if TrackKind::from_codec(transceiver.kind()) == Some(kind) {
        transceiver.set_direction(direction).await;
      }
    }
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.pc.close().await?;
    Ok(())
  }
}

async fn wrap_channel(dc: Arc<RTCDataChannel>, max_message_size: usize) -> ChannelHandle {
  let (tx, rx) = mpsc::unbounded_channel();

  let open_tx = tx.clone();
  dc.on_open(Box::new(move || {
    Box::pin(async move {
      let _ = open_tx.send(ChannelEvent::Open);
    })
  }));

  let message_tx = tx.clone();
  let label = dc.label().to_string();
  dc.on_message(Box::new(move |msg: DataChannelMessage| {
    let tx = message_tx.clone();
    let label = label.clone();
    Box::pin(async move {
      let message = if msg.is_string {
        match String::from_utf8(msg.data.to_vec()) {
          Ok(text) => ChannelMessage::Text(text),
          Err(_) => {
            warn!(event = "invalid_text_frame", label = %label);
            return;
          }
        }
      } else {
        ChannelMessage::Binary(msg.data)
      };
      let _ = tx.send(ChannelEvent::Message(message));
    })
  }));

  dc.set_buffered_amount_low_threshold(0).await;
  let low_tx = tx.clone();
  dc.on_buffered_amount_low(Box::new(move || {
    let tx = low_tx.clone();
    Box::pin(async move {
      let _ = tx.send(ChannelEvent::BufferedAmountLow);
    })
  }))
  .await;

  let close_tx = tx.clone();
  dc.on_close(Box::new(move || {
    let tx = close_tx.clone();
    Box::pin(async move {
      let _ = tx.send(ChannelEvent::Close);
    })
  }));

  ChannelHandle {
    channel: Arc::new(RtcDataChannel {
      dc,
      events: tx,
      max_message_size,
    }),
    events: rx,
  }
}

struct RtcDataChannel {
  dc: Arc<RTCDataChannel>,
  events: mpsc::UnboundedSender<ChannelEvent>,
  max_message_size: usize,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
  fn label(&self) -> &str {
    self.dc.label()
  }

  fn ready_state(&self) -> ChannelState {
    match self.dc.ready_state() {
      RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => ChannelState::Connecting,
      RTCDataChannelState::Open => ChannelState::Open,
      RTCDataChannelState::Closing => ChannelState::Closing,
      RTCDataChannelState::Closed => ChannelState::Closed,
    }
  }

  fn max_message_size(&self) -> usize {
    self.max_message_size
  }

  async fn send_text(&self, text: &str) -> Result<()> {
    self.dc.send_text(text.to_string()).await?;
    Ok(())
  }

  async fn send_binary(&self, data: Bytes) -> Result<()> {
    self.dc.send(&data).await?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    let was_closed = self.ready_state() == ChannelState::Closed;
    self.dc.close().await?;
    // webrtc-rs does not fire on_close for locally initiated closes.
    if !was_closed {
      let _ = self.events.send(ChannelEvent::Close);
    }
    Ok(())
  }
}
