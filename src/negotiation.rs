//! Perfect negotiation: symmetric offer/answer/ICE exchange where glare is
//! settled by each pair's polite side yielding.
//!
//! Inbound passthrough for a peer is applied strictly in arrival order by a
//! per-peer worker. Nothing here propagates errors: a failed step is logged
//! and the link is left as-is for the next negotiation-needed round.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::media::{CallingConstraints, MediaCalling};
use crate::registry::{PeerRegistry, PeerTransport};
use crate::signaling::{
  ice_passthrough, sdp_passthrough, IncomingPassthrough, PassthroughBody, PeerArrival, SignalSender,
};
use crate::transport::{PeerEvent, SdpType, SessionDescription, SignalingState};

pub type PeerEventSender = mpsc::UnboundedSender<(String, PeerEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
  Applied,
  /// Rejected because it belongs to a remote offer this side ignored.
  Ignored,
  Failed,
}

pub struct Negotiator {
  registry: Arc<PeerRegistry>,
  media: Arc<MediaCalling>,
  signal_tx: SignalSender,
  peer_events: PeerEventSender,
}

impl Negotiator {
  pub fn new(
    registry: Arc<PeerRegistry>,
    media: Arc<MediaCalling>,
    signal_tx: SignalSender,
    peer_events: PeerEventSender,
  ) -> Self {
    Self {
      registry,
      media,
      signal_tx,
      peer_events,
    }
  }

  /// Gets the peer's transport; on creation, starts its event forwarder and
  /// passthrough worker and attaches any local call tracks.
  pub async fn locate(self: &Arc<Self>, peer_id: &str, display_name: Option<&str>) -> Result<Arc<PeerTransport>> {
    let located = self.registry.locate(peer_id, display_name).await?;
    if let Some(created) = located.created {
      let transport = located.transport.clone();

      let mut events = created.events;
      let forward = self.peer_events.clone();
      let forward_id = peer_id.to_string();
      tokio::spawn(async move {
        while let Some(event) = events.recv().await {
          if forward.send((forward_id.clone(), event)).is_err() {
            break;
          }
        }
      });

      let worker = self.clone();
      let worker_transport = transport.clone();
      let mut passthrough = created.passthrough;
      tokio::spawn(async move {
        while let Some(body) = passthrough.recv().await {
          worker.apply_passthrough(&worker_transport, body).await;
        }
        debug!(event = "passthrough_worker_stopped", peer_id = %worker_transport.peer_id);
      });

      self.media.add_local_tracks_if_possible(&transport).await;
    }
    Ok(located.transport)
  }

  pub async fn handle_peer_arrival(self: &Arc<Self>, arrival: &PeerArrival) {
    for (peer_id, name, is_new_peer_polite) in arrival.peers() {
      if peer_id.is_empty() {
        continue;
      }
      match self.locate(&peer_id, Some(&name)).await {
        Ok(transport) => {
          transport.setup_offer_collision(is_new_peer_polite).await;
          info!(
            event = "peer_arrived",
            peer_id = %peer_id,
            name = %name,
            local_polite = !is_new_peer_polite
          );
        }
        Err(err) => error!(event = "peer_locate_failed", peer_id = %peer_id, error = %err),
      }
    }
  }

  /// Queues the message behind earlier passthrough from the same peer.
  pub async fn handle_passthrough(self: &Arc<Self>, incoming: IncomingPassthrough) {
    let transport = match self.locate(&incoming.from, None).await {
      Ok(transport) => transport,
      Err(err) => {
        error!(event = "peer_locate_failed", peer_id = %incoming.from, error = %err);
        return;
      }
    };
    if let Err(err) = transport.enqueue_passthrough(incoming.body).await {
      warn!(event = "passthrough_dropped", peer_id = %incoming.from, error = %err);
    }
  }

  pub async fn apply_passthrough(&self, transport: &PeerTransport, body: PassthroughBody) {
    match body {
      PassthroughBody::Ice { ice_candidate } => {
        self.apply_remote_candidate(transport, ice_candidate).await;
      }
      PassthroughBody::Sdp {
        sdp,
        calling_constraints,
      } => self.apply_remote_description(transport, sdp, calling_constraints).await,
    }
  }

  async fn apply_remote_candidate(&self, transport: &PeerTransport, candidate: RTCIceCandidateInit) -> CandidateOutcome {
    let Err(err) = transport.link.add_ice_candidate(candidate).await else {
      return CandidateOutcome::Applied;
    };
    // Candidates of an offer we chose to ignore are expected to fail.
    if transport.flags.lock().await.ignore_remote_offer {
      debug!(event = "ignored_offer_candidate_dropped", peer_id = %transport.peer_id);
      return CandidateOutcome::Ignored;
    }
    warn!(event = "add_ice_candidate_failed", peer_id = %transport.peer_id, error = %err);
    CandidateOutcome::Failed
  }

  async fn apply_remote_description(
    &self,
    transport: &PeerTransport,
    sdp: SessionDescription,
    calling_constraints: Option<CallingConstraints>,
  ) {
    let peer_id = transport.peer_id.as_str();
    let kind = sdp.kind;
    let state = transport.link.signaling_state();
    {
      let mut flags = transport.flags.lock().await;
      let is_stable = state == SignalingState::Stable
        || (state == SignalingState::HaveLocalOffer && flags.is_setting_remote_answer_pending);
      let is_ready_for_offer = !flags.making_offer && is_stable;
      let is_offer_collision = kind == SdpType::Offer && !is_ready_for_offer;
      if is_offer_collision {
        debug!(event = "offer_collision", peer_id = %peer_id, state = ?state, polite = flags.is_local_polite);
      }
      flags.ignore_remote_offer = is_offer_collision && !flags.is_local_polite;
      if flags.ignore_remote_offer {
        info!(event = "remote_offer_ignored", peer_id = %peer_id);
        return;
      }
      if kind == SdpType::Answer {
        flags.is_setting_remote_answer_pending = true;
      }
    }

    *transport.remote_constraints.lock().await = calling_constraints;

    let applied = transport.link.set_remote_description(sdp).await;
    if kind == SdpType::Answer {
      transport.flags.lock().await.is_setting_remote_answer_pending = false;
    }
    if let Err(err) = applied {
      error!(event = "set_remote_description_failed", peer_id = %peer_id, kind = ?kind, error = %err);
      return;
    }
    if kind != SdpType::Offer {
      return;
    }

    match transport.link.set_local_description().await {
      Ok(answer) => {
        debug!(event = "answer_sent", peer_id = %peer_id);
        let _ = self.signal_tx.send(sdp_passthrough(peer_id, answer, None));
      }
      Err(err) => error!(event = "set_local_description_failed", peer_id = %peer_id, error = %err),
    }
  }

  /// Creates and sends a local offer. `making_offer` is cleared whatever the
  /// outcome.
  pub async fn handle_negotiation_needed(&self, peer_id: &str) {
    let Some(transport) = self.registry.get(peer_id).await else {
      debug!(event = "negotiation_for_unknown_peer", peer_id = %peer_id);
      return;
    };
    transport.flags.lock().await.making_offer = true;

    let offered = async {
      let offer = transport.link.set_local_description().await?;
      if offer.kind != SdpType::Offer {
        return Err(anyhow!("expected a local offer, got {:?}", offer.kind));
      }
      Ok(offer)
    }
    .await;
    match offered {
      Ok(offer) => {
        debug!(event = "offer_sent", peer_id = %peer_id);
        let constraints = self.media.calling_constraints().await;
        let _ = self.signal_tx.send(sdp_passthrough(peer_id, offer, constraints));
      }
      Err(err) => error!(event = "negotiation_failed", peer_id = %peer_id, error = %err),
    }

    transport.flags.lock().await.making_offer = false;
  }

  pub fn handle_local_candidate(&self, peer_id: &str, candidate: RTCIceCandidateInit) {
    let _ = self.signal_tx.send(ice_passthrough(peer_id, candidate));
  }

  pub async fn handle_peer_leave(&self, peer_id: &str) {
    if !self.registry.remove(peer_id).await {
      debug!(event = "leave_for_unknown_peer", peer_id = %peer_id);
    }
  }

  pub async fn close_all(&self) {
    self.registry.close_all().await;
  }
}
