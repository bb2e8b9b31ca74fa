//! Calling constraints, local track plumbing and the table of remote tracks
//! per peer. Capture and rendering stay with the embedding application; this
//! only attaches, pauses and detaches tracks.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::track::track_local::TrackLocal;

use crate::listener::Listener;
use crate::registry::{PeerRegistry, PeerTransport};
use crate::transport::TrackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingInputType {
  MicrophoneAudio,
  ScreenAudio,
  CameraVideo,
  ScreenVideo,
}

/// Which inputs a side is calling with; sent alongside every local offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallingConstraints {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub microphone_audio: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub screen_audio: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub camera_video: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub screen_video: Option<bool>,
}

impl CallingConstraints {
  pub fn from_inputs(inputs: &[CallingInputType]) -> Self {
    let mut constraints = Self::default();
    for input in inputs {
      let slot = match input {
        CallingInputType::MicrophoneAudio => &mut constraints.microphone_audio,
        CallingInputType::ScreenAudio => &mut constraints.screen_audio,
        CallingInputType::CameraVideo => &mut constraints.camera_video,
        CallingInputType::ScreenVideo => &mut constraints.screen_video,
      };
      *slot = Some(true);
    }
    constraints
  }

  pub fn wants(&self, input: CallingInputType) -> bool {
    let value = match input {
      CallingInputType::MicrophoneAudio => self.microphone_audio,
      CallingInputType::ScreenAudio => self.screen_audio,
      CallingInputType::CameraVideo => self.camera_video,
      CallingInputType::ScreenVideo => self.screen_video,
    };
    value.unwrap_or(false)
  }
}

/// Remote tracks currently delivering media from one peer, by track id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerMediaContext {
  pub audio: Option<String>,
  pub video: Option<String>,
}

impl PeerMediaContext {
  fn slot(&mut self, kind: TrackKind) -> &mut Option<String> {
    match kind {
      TrackKind::Audio => &mut self.audio,
      TrackKind::Video => &mut self.video,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.audio.is_none() && self.video.is_none()
  }
}

pub type RemoteMedia = BTreeMap<String, PeerMediaContext>;

type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Default)]
struct CallingState {
  constraints: Option<CallingConstraints>,
  tracks: Vec<LocalTrack>,
  calling: bool,
  disabled: BTreeSet<TrackKind>,
  muted: BTreeSet<TrackKind>,
}

impl CallingState {
  fn track_of(&self, kind: TrackKind) -> Option<LocalTrack> {
    self
      .tracks
      .iter()
      .find(|track| TrackKind::from_codec(track.kind()) == Some(kind))
      .cloned()
  }
}

#[derive(Default)]
pub struct MediaCalling {
  state: Mutex<CallingState>,
  remote: Mutex<RemoteMedia>,
  calling_listener: Listener<bool>,
  remote_listener: Listener<RemoteMedia>,
}

impl MediaCalling {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn apply_calling_input_types(&self, inputs: &[CallingInputType]) {
    self.state.lock().await.constraints = Some(CallingConstraints::from_inputs(inputs));
  }

  pub async fn calling_constraints(&self) -> Option<CallingConstraints> {
    self.state.lock().await.constraints
  }

  pub async fn is_calling(&self) -> bool {
    self.state.lock().await.calling
  }

  /// Receives `true` when a call starts and `false` when it is hung up.
  pub async fn subscribe_calling_state(&self) -> mpsc::UnboundedReceiver<bool> {
    self.calling_listener.subscribe().await
  }

  /// Attaches `tracks` to every current peer, and to peers that arrive later.
  pub async fn start_calling(&self, registry: &PeerRegistry, tracks: Vec<LocalTrack>) {
    let was_calling = {
      let mut state = self.state.lock().await;
      state.tracks = tracks;
      std::mem::replace(&mut state.calling, true)
    };
    for transport in registry.transports().await {
      self.add_local_tracks_if_possible(&transport).await;
    }
    if !was_calling {
      info!(event = "calling_started");
      self.calling_listener.notify(true).await;
    }
  }

  /// Adds the call's tracks to a peer, carrying over any paused or muted kinds.
  pub async fn add_local_tracks_if_possible(&self, transport: &PeerTransport) {
    let (tracks, disabled, muted) = {
      let state = self.state.lock().await;
      if !state.calling {
        return;
      }
      (state.tracks.clone(), state.disabled.clone(), state.muted.clone())
    };
    for track in tracks {
      if let Err(err) = transport.link.add_track(track).await {
        warn!(event = "add_track_failed", peer_id = %transport.peer_id, error = %err);
      }
    }
    for kind in disabled {
      if let Err(err) = transport.link.replace_tracks(kind, None).await {
        warn!(event = "pause_track_failed", peer_id = %transport.peer_id, kind = %kind, error = %err);
      }
    }
    for kind in muted {
      if let Err(err) = transport.link.set_sending(kind, false).await {
        warn!(event = "mute_track_failed", peer_id = %transport.peer_id, kind = %kind, error = %err);
      }
    }
  }

  /// Pauses or resumes the local `kind` track on every peer by swapping the
  /// senders' source. No renegotiation happens.
  pub async fn set_local_track_enabled(&self, registry: &PeerRegistry, kind: TrackKind, enabled: bool) {
    let source = {
      let mut state = self.state.lock().await;
      let Some(track) = state.track_of(kind).filter(|_| state.calling) else {
        warn!(event = "no_local_track", kind = %kind);
        return;
      };
      if enabled {
        state.disabled.remove(&kind);
        Some(track)
      } else {
        state.disabled.insert(kind);
        None
      }
    };
    for transport in registry.transports().await {
      if let Err(err) = transport.link.replace_tracks(kind, source.clone()).await {
        warn!(event = "replace_track_failed", peer_id = %transport.peer_id, kind = %kind, error = %err);
      }
    }
    debug!(event = "local_track_enabled", kind = %kind, enabled);
  }

  pub async fn local_track_enabled(&self, kind: TrackKind) -> bool {
    let state = self.state.lock().await;
    state.calling && state.track_of(kind).is_some() && !state.disabled.contains(&kind)
  }

  /// Switches the `kind` transceivers of every peer to receive-only, or back.
  pub async fn set_local_track_muted(&self, registry: &PeerRegistry, kind: TrackKind, muted: bool) {
    {
      let mut state = self.state.lock().await;
      if muted {
        state.muted.insert(kind);
      } else {
        state.muted.remove(&kind);
      }
    }
    for transport in registry.transports().await {
      if let Err(err) = transport.link.set_sending(kind, !muted).await {
        warn!(event = "mute_track_failed", peer_id = %transport.peer_id, kind = %kind, error = %err);
      }
    }
    debug!(event = "local_track_muted", kind = %kind, muted);
  }

  pub async fn local_track_muted(&self, kind: TrackKind) -> bool {
    let state = self.state.lock().await;
    !state.calling || state.track_of(kind).is_none() || state.muted.contains(&kind)
  }

  pub async fn hang_up(&self, registry: &PeerRegistry) -> Result<()> {
    let was_calling = {
      let mut state = self.state.lock().await;
      let was_calling = state.calling;
      *state = CallingState::default();
      was_calling
    };
    if !was_calling {
      return Ok(());
    }
    for transport in registry.transports().await {
      transport.link.remove_tracks().await?;
    }
    info!(event = "calling_hung_up");
    self.calling_listener.notify(false).await;
    Ok(())
  }

  pub async fn subscribe_remote_media(&self) -> mpsc::UnboundedReceiver<RemoteMedia> {
    self.remote_listener.subscribe().await
  }

  pub async fn remote_media(&self) -> RemoteMedia {
    self.remote.lock().await.clone()
  }

  async fn update_remote(&self, peer_id: &str, kind: TrackKind, track_id: Option<String>) {
    let mut remote = self.remote.lock().await;
    match track_id {
      Some(track_id) => {
        *remote.entry(peer_id.to_string()).or_default().slot(kind) = Some(track_id);
      }
      None => {
        let Some(context) = remote.get_mut(peer_id) else {
          return;
        };
        context.slot(kind).take();
        if context.is_empty() {
          remote.remove(peer_id);
        }
      }
    }
    self.remote_listener.notify(remote.clone()).await;
  }

  pub async fn handle_remote_track(&self, peer_id: &str, kind: TrackKind, track_id: String) {
    self.update_remote(peer_id, kind, Some(track_id)).await;
  }

  /// A peer sharing its screen keeps its video listed through mutes; screen
  /// capture flaps between muted and unmuted.
  pub async fn handle_remote_track_muted(&self, peer_id: &str, kind: TrackKind, screen_sharing: bool) {
    if screen_sharing {
      return;
    }
    self.update_remote(peer_id, kind, None).await;
  }

  pub async fn handle_remote_track_unmuted(&self, peer_id: &str, kind: TrackKind, track_id: String) {
    self.update_remote(peer_id, kind, Some(track_id)).await;
  }

  /// Forgets every remote track of a peer that left or whose connection ended.
  pub async fn remove_peer_media(&self, peer_id: &str) {
    let mut remote = self.remote.lock().await;
    if remote.remove(peer_id).is_some() {
      self.remote_listener.notify(remote.clone()).await;
    }
  }

  pub async fn clear_remote_media(&self) {
    let mut remote = self.remote.lock().await;
    if !remote.is_empty() {
      remote.clear();
      self.remote_listener.notify(remote.clone()).await;
    }
  }
}
