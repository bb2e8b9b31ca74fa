//! Signaling bus: JSON frames `{"type": ..., "payload": ...}` over a websocket.
//!
//! Payload variants that the wire distinguishes only by field presence
//! (peer arrival, passthrough) are decided once here, at deserialization.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use url::Url;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::media::CallingConstraints;
use crate::transport::SessionDescription;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
  #[serde(default)]
  pub room_id: Option<String>,
  #[serde(default)]
  pub room_name: Option<String>,
}

/// Peer arrival, tagged with the politeness of the *arriving* side.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PeerArrival {
  NewPeer {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "userName")]
    user_name: String,
    #[serde(rename = "isPolite")]
    is_polite: bool,
  },
  ExistingPeers {
    #[serde(rename = "userContainer")]
    user_container: BTreeMap<String, String>,
    #[serde(rename = "isPolite")]
    is_polite: bool,
  },
}

impl PeerArrival {
  /// `(peer id, display name, remote side is polite)` for every peer named.
  pub fn peers(&self) -> Vec<(String, String, bool)> {
    match self {
      PeerArrival::NewPeer {
        user_id,
        user_name,
        is_polite,
      } => vec![(user_id.clone(), user_name.clone(), *is_polite)],
      PeerArrival::ExistingPeers {
        user_container,
        is_polite,
      } => user_container
        .iter()
        .map(|(peer_id, name)| (peer_id.clone(), name.clone(), *is_polite))
        .collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerLeave {
  #[serde(rename = "userId")]
  pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PassthroughBody {
  Sdp {
    sdp: SessionDescription,
    #[serde(rename = "callingConstraints", default, skip_serializing_if = "Option::is_none")]
    calling_constraints: Option<CallingConstraints>,
  },
  Ice {
    #[serde(rename = "iceCandidate")]
    ice_candidate: RTCIceCandidateInit,
  },
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingPassthrough {
  pub from: String,
  #[serde(flatten)]
  pub body: PassthroughBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingPassthrough {
  pub to: String,
  #[serde(flatten)]
  pub body: PassthroughBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerSignal {
  #[serde(rename = "PING")]
  Ping,
  #[serde(rename = "UPDATE_ROOMS")]
  UpdateRooms(serde_json::Value),
  #[serde(rename = "JOIN_ROOM_SUCCESS")]
  JoinRoomSuccess(RoomInfo),
  #[serde(rename = "LEAVE_ROOM_SUCCESS")]
  LeaveRoomSuccess(RoomInfo),
  #[serde(rename = "WEBRTC_NEW_PEER_ARIVAL")]
  PeerArrival(PeerArrival),
  #[serde(rename = "WEBRTC_NEW_PASSTHROUGH")]
  Passthrough(IncomingPassthrough),
  #[serde(rename = "WEBRTC_NEW_PEER_LEAVE")]
  PeerLeave(PeerLeave),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientSignal {
  #[serde(rename = "PONG")]
  Pong,
  #[serde(rename = "CREATE_ROOM")]
  CreateRoom {
    #[serde(rename = "roomName")]
    room_name: String,
  },
  #[serde(rename = "JOIN_ROOM")]
  JoinRoom {
    #[serde(rename = "roomId")]
    room_id: String,
  },
  #[serde(rename = "LEAVE_ROOM")]
  LeaveRoom {},
  #[serde(rename = "WEBRTC_NEW_PASSTHROUGH")]
  Passthrough(OutgoingPassthrough),
}

pub type SignalSender = mpsc::UnboundedSender<ClientSignal>;

/// A live websocket: writer and reader tasks bridged to channels.
pub struct SignalingConnection {
  outgoing: SignalSender,
  writer: JoinHandle<Result<()>>,
  reader: JoinHandle<Result<()>>,
}

impl SignalingConnection {
  /// Connects and returns the connection with the stream of server signals.
  /// `PING` is answered here and never reaches the stream.
  pub async fn connect(ws_url: &Url) -> Result<(Self, mpsc::UnboundedReceiver<ServerSignal>)> {
    info!(event = "signaling_connecting", url = %ws_url);
    let (ws_stream, _) = connect_async(ws_url.to_string())
      .await
      .context("connect signaling websocket")?;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ClientSignal>();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ServerSignal>();

    let writer = tokio::spawn(async move {
      while let Some(msg) = signal_rx.recv().await {
        let text = serde_json::to_string(&msg).map_err(|err| anyhow!(err))?;
        ws_write.send(Message::Text(text)).await.map_err(|err| anyhow!(err))?;
      }
      let _ = ws_write.close().await;
      Ok::<(), anyhow::Error>(())
    });

    let pong_tx = signal_tx.clone();
    let reader = tokio::spawn(async move {
      while let Some(msg) = ws_read.next().await {
        let msg = msg.context("websocket read")?;
        let Message::Text(text) = msg else {
          continue;
        };
        let parsed: ServerSignal = match serde_json::from_str(&text) {
          Ok(signal) => signal,
          Err(err) => {
            debug!(event = "signal_skipped", error = %err, frame = %text);
            continue;
          }
        };
        if matches!(parsed, ServerSignal::Ping) {
          let _ = pong_tx.send(ClientSignal::Pong);
          continue;
        }
        if incoming_tx.send(parsed).is_err() {
          break;
        }
      }
      info!(event = "signaling_closed");
      Ok::<(), anyhow::Error>(())
    });

    let connection = Self {
      outgoing: signal_tx,
      writer,
      reader,
    };
    Ok((connection, incoming_rx))
  }

  pub fn sender(&self) -> SignalSender {
    self.outgoing.clone()
  }

  /// Stops both pumps; queued outgoing frames are dropped.
  pub fn shutdown(&self) {
    self.writer.abort();
    self.reader.abort();
  }
}

/// Turns an `http(s)`/`ws(s)` endpoint into the websocket URL, tagging it with
/// this client's id and display name.
pub fn build_ws_url(endpoint: &str, client_id: &str, display_name: &str) -> Result<Url> {
  let mut url = Url::parse(endpoint).with_context(|| format!("parse endpoint {endpoint}"))?;
  let scheme = match url.scheme() {
    "https" | "wss" => "wss",
    "http" | "ws" => "ws",
    other => return Err(anyhow!("Unsupported endpoint scheme: {other}")),
  };
  url.set_scheme(scheme).map_err(|_| anyhow!("Invalid endpoint scheme"))?;
  url.set_fragment(None);
  url
    .query_pairs_mut()
    .append_pair("cid", client_id)
    .append_pair("name", display_name);
  Ok(url)
}

pub fn sdp_passthrough(
  to: &str,
  sdp: SessionDescription,
  calling_constraints: Option<CallingConstraints>,
) -> ClientSignal {
  ClientSignal::Passthrough(OutgoingPassthrough {
    to: to.to_string(),
    body: PassthroughBody::Sdp {
      sdp,
      calling_constraints,
    },
  })
}

pub fn ice_passthrough(to: &str, ice_candidate: RTCIceCandidateInit) -> ClientSignal {
  ClientSignal::Passthrough(OutgoingPassthrough {
    to: to.to_string(),
    body: PassthroughBody::Ice { ice_candidate },
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::SdpType;
  use serde_json::json;

  #[test]
  fn ping_has_no_payload() {
    let signal: ServerSignal = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
    assert!(matches!(signal, ServerSignal::Ping));
    assert_eq!(serde_json::to_value(ClientSignal::Pong).unwrap(), json!({"type": "PONG"}));
  }

  #[test]
  fn new_peer_arrival() {
    let signal: ServerSignal = serde_json::from_value(json!({
      "type": "WEBRTC_NEW_PEER_ARIVAL",
      "payload": {"userId": "u1", "userName": "Ada", "isPolite": true}
    }))
    .unwrap();
    let ServerSignal::PeerArrival(arrival) = signal else {
      panic!("expected arrival");
    };
    assert_eq!(arrival.peers(), vec![("u1".to_string(), "Ada".to_string(), true)]);
  }

  #[test]
  fn existing_peers_arrival() {
    let arrival: PeerArrival = serde_json::from_value(json!({
      "userContainer": {"u1": "Ada", "u2": "Bob"},
      "isPolite": false
    }))
    .unwrap();
    assert!(matches!(arrival, PeerArrival::ExistingPeers { .. }));
    assert_eq!(arrival.peers().len(), 2);
  }

  #[test]
  fn passthrough_variants_are_decided_by_shape() {
    let sdp: IncomingPassthrough = serde_json::from_value(json!({
      "from": "u1",
      "sdp": {"type": "offer", "sdp": "v=0"},
      "callingConstraints": {"microphone_audio": true}
    }))
    .unwrap();
    match sdp.body {
      PassthroughBody::Sdp {
        sdp,
        calling_constraints,
      } => {
        assert_eq!(sdp.kind, SdpType::Offer);
        assert_eq!(calling_constraints.unwrap().microphone_audio, Some(true));
      }
      PassthroughBody::Ice { .. } => panic!("expected sdp"),
    }

    let ice: IncomingPassthrough = serde_json::from_value(json!({
      "from": "u1",
      "iceCandidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
    }))
    .unwrap();
    assert!(matches!(ice.body, PassthroughBody::Ice { .. }));
  }

  #[test]
  fn outgoing_answer_omits_constraints() {
    let signal = sdp_passthrough("u2", SessionDescription::new(SdpType::Answer, "v=0"), None);
    assert_eq!(
      serde_json::to_value(signal).unwrap(),
      json!({
        "type": "WEBRTC_NEW_PASSTHROUGH",
        "payload": {"to": "u2", "sdp": {"type": "answer", "sdp": "v=0"}}
      })
    );
  }

  #[test]
  fn room_commands() {
    let join = serde_json::to_value(ClientSignal::JoinRoom {
      room_id: "r1".to_string(),
    })
    .unwrap();
    assert_eq!(join, json!({"type": "JOIN_ROOM", "payload": {"roomId": "r1"}}));
    let leave = serde_json::to_value(ClientSignal::LeaveRoom {}).unwrap();
    assert_eq!(leave, json!({"type": "LEAVE_ROOM", "payload": {}}));
  }

  #[test]
  fn ws_url_from_https_endpoint() {
    let url = build_ws_url("https://signal.example.com/socket", "c1", "Ada Lovelace").unwrap();
    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.path(), "/socket");
    assert_eq!(url.query(), Some("cid=c1&name=Ada+Lovelace"));
    assert!(build_ws_url("ftp://example.com", "c1", "x").is_err());
  }
}
