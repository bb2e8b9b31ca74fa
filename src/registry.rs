//! One `PeerTransport` per remote peer, created on first reference.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::listener::Listener;
use crate::media::CallingConstraints;
use crate::signaling::PassthroughBody;
use crate::transport::{Connector, PeerEvent, PeerLink};

/// Perfect-negotiation markers, consulted together with the link's own
/// signaling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationFlags {
  pub making_offer: bool,
  pub ignore_remote_offer: bool,
  pub is_setting_remote_answer_pending: bool,
  pub is_local_polite: bool,
}

pub struct PeerTransport {
  pub peer_id: String,
  pub display_name: Option<String>,
  pub link: Arc<dyn PeerLink>,
  pub flags: Mutex<NegotiationFlags>,
  /// What the remote side said it is calling with, from its last description.
  pub remote_constraints: Mutex<Option<CallingConstraints>>,
  passthrough_tx: Mutex<Option<mpsc::UnboundedSender<PassthroughBody>>>,
}

impl PeerTransport {
  /// Queues inbound SDP/ICE for this peer's sequential worker.
  pub async fn enqueue_passthrough(&self, body: PassthroughBody) -> Result<()> {
    let guard = self.passthrough_tx.lock().await;
    let tx = guard
      .as_ref()
      .ok_or_else(|| anyhow!("peer {} already closed", self.peer_id))?;
    tx.send(body).map_err(|_| anyhow!("passthrough worker for {} stopped", self.peer_id))
  }

  /// Resets the collision markers with politeness derived from the arriving
  /// side's flag.
  pub async fn setup_offer_collision(&self, is_new_peer_polite: bool) {
    *self.flags.lock().await = NegotiationFlags {
      is_local_polite: !is_new_peer_polite,
      ..NegotiationFlags::default()
    };
  }

  async fn close(&self) {
    self.passthrough_tx.lock().await.take();
    if let Err(err) = self.link.close().await {
      warn!(event = "peer_close_failed", peer_id = %self.peer_id, error = %err);
    }
  }
}

/// Receivers handed out only when `locate` created the transport.
pub struct CreatedPeer {
  pub events: mpsc::UnboundedReceiver<PeerEvent>,
  pub passthrough: mpsc::UnboundedReceiver<PassthroughBody>,
}

pub struct Located {
  pub transport: Arc<PeerTransport>,
  pub created: Option<CreatedPeer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
  pub name: Option<String>,
}

pub type PeersInfo = BTreeMap<String, PeerInfo>;

pub struct PeerRegistry {
  connector: Arc<dyn Connector>,
  peers: Mutex<BTreeMap<String, Arc<PeerTransport>>>,
  listener: Listener<PeersInfo>,
}

impl PeerRegistry {
  pub fn new(connector: Arc<dyn Connector>) -> Self {
    Self {
      connector,
      peers: Mutex::new(BTreeMap::new()),
      listener: Listener::default(),
    }
  }

  pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<PeersInfo> {
    self.listener.subscribe().await
  }

  fn info_of(peers: &BTreeMap<String, Arc<PeerTransport>>) -> PeersInfo {
    peers
      .iter()
      .map(|(peer_id, transport)| {
        (
          peer_id.clone(),
          PeerInfo {
            name: transport.display_name.clone(),
          },
        )
      })
      .collect()
  }

  /// Returns the peer's transport, creating and connecting it on first use.
  pub async fn locate(&self, peer_id: &str, display_name: Option<&str>) -> Result<Located> {
    if peer_id.is_empty() {
      return Err(anyhow!("empty peer id"));
    }
    let mut peers = self.peers.lock().await;
    if let Some(transport) = peers.get(peer_id) {
      return Ok(Located {
        transport: transport.clone(),
        created: None,
      });
    }

    let (link, events) = self.connector.connect(peer_id).await?;
    let (passthrough_tx, passthrough) = mpsc::unbounded_channel();
    let transport = Arc::new(PeerTransport {
      peer_id: peer_id.to_string(),
      display_name: display_name.map(str::to_string),
      link,
      flags: Mutex::new(NegotiationFlags::default()),
      remote_constraints: Mutex::new(None),
      passthrough_tx: Mutex::new(Some(passthrough_tx)),
    });
    peers.insert(peer_id.to_string(), transport.clone());
    info!(event = "peer_added", peer_id = %peer_id, peers = peers.len());
    self.listener.notify(Self::info_of(&peers)).await;

    Ok(Located {
      transport,
      created: Some(CreatedPeer { events, passthrough }),
    })
  }

  pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerTransport>> {
    self.peers.lock().await.get(peer_id).cloned()
  }

  pub async fn peer_ids(&self) -> Vec<String> {
    self.peers.lock().await.keys().cloned().collect()
  }

  pub async fn transports(&self) -> Vec<Arc<PeerTransport>> {
    self.peers.lock().await.values().cloned().collect()
  }

  pub async fn peer_name(&self, peer_id: &str) -> Option<String> {
    self
      .peers
      .lock()
      .await
      .get(peer_id)
      .and_then(|transport| transport.display_name.clone())
  }

  pub async fn peers_info(&self) -> PeersInfo {
    Self::info_of(&*self.peers.lock().await)
  }

  /// Closes and forgets the peer, whatever negotiation is in flight.
  pub async fn remove(&self, peer_id: &str) -> bool {
    let removed = {
      let mut peers = self.peers.lock().await;
      let removed = peers.remove(peer_id);
      if removed.is_some() {
        self.listener.notify(Self::info_of(&peers)).await;
      }
      removed
    };
    match removed {
      Some(transport) => {
        transport.close().await;
        info!(event = "peer_removed", peer_id = %peer_id);
        true
      }
      None => false,
    }
  }

  pub async fn close_all(&self) {
    let drained = {
      let mut peers = self.peers.lock().await;
      let drained = std::mem::take(&mut *peers);
      self.listener.notify(PeersInfo::new()).await;
      drained
    };
    for (peer_id, transport) in drained {
      transport.close().await;
      debug!(event = "peer_closed", peer_id = %peer_id);
    }
  }

  pub async fn len(&self) -> usize {
    self.peers.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.peers.lock().await.is_empty()
  }
}
