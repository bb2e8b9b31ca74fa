use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use meshlane::config::Config;
use meshlane::session::{Session, SessionEvent};
use meshlane::signaling::{build_ws_url, SignalingConnection};
use meshlane::store::{DiskChunkStore, FileKey};
use meshlane::transfer::format_bytes;
use meshlane::transport::rtc::RtcConnector;

#[derive(Parser, Debug)]
#[command(name = "meshlane")]
#[command(about = "Peer-mesh file transfer and chat over WebRTC")]
struct Cli {
  #[arg(long, global = true, value_name = "PATH", help = "Config file (default ~/.config/meshlane/config.toml)")]
  config: Option<PathBuf>,
  #[arg(long, global = true, value_name = "URL", help = "Override signaling endpoint")]
  endpoint: Option<String>,
  #[arg(long, global = true, value_name = "NAME", help = "Display name announced to peers")]
  name: Option<String>,
  #[arg(long, global = true, value_name = "DIR", help = "Chunk store directory")]
  store_dir: Option<PathBuf>,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create a room and stay in it.
  Create {
    #[arg(value_name = "ROOM_NAME")]
    room_name: String,
    #[arg(long, default_value = ".", value_name = "DIR", help = "Where received files are saved")]
    output_dir: PathBuf,
  },
  /// Join a room, optionally sending files once a peer is present.
  Join {
    #[arg(value_name = "ROOM_ID")]
    room_id: String,
    #[arg(long = "send", value_name = "FILE", help = "File to send (repeatable)")]
    send: Vec<PathBuf>,
    #[arg(long, default_value = ".", value_name = "DIR", help = "Where received files are saved")]
    output_dir: PathBuf,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshlane=info")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let mut config = Config::load(cli.config.as_deref())?;
  if let Some(endpoint) = cli.endpoint {
    config.endpoint = endpoint;
  }
  if let Some(name) = cli.name {
    config.display_name = name;
  }
  if let Some(store_dir) = cli.store_dir {
    config.store_dir = store_dir;
  }
  config.validate()?;

  match cli.command {
    Command::Create { room_name, output_dir } => run_room(&config, Action::Create(room_name), Vec::new(), output_dir).await,
    Command::Join {
      room_id,
      send,
      output_dir,
    } => run_room(&config, Action::Join(room_id), send, output_dir).await,
  }
}

enum Action {
  Create(String),
  Join(String),
}

async fn run_room(config: &Config, action: Action, initial_files: Vec<PathBuf>, output_dir: PathBuf) -> Result<()> {
  let client_id = Uuid::new_v4().to_string();
  let ws_url = build_ws_url(&config.endpoint, &client_id, &config.display_name)?;
  log_line("[ws] connecting", ws_url.as_str());
  let (connection, incoming) = SignalingConnection::connect(&ws_url).await?;

  let store = DiskChunkStore::open(&config.store_dir)
    .await
    .with_context(|| format!("open chunk store {}", config.store_dir.display()))?;
  let connector = RtcConnector::new(config.ice_servers.clone())?;
  let session = Session::new(
    config.transfer_options(),
    Arc::new(connector),
    Arc::new(store),
    connection.sender(),
  );

  spawn_event_log(&session).await;
  spawn_chat_log(&session).await;
  spawn_peer_watch(&session, initial_files).await;
  spawn_progress_log(&session).await;
  spawn_exporter(&session, output_dir).await;

  let runner = {
    let session = session.clone();
    tokio::spawn(async move { session.run(incoming).await })
  };

  match action {
    Action::Create(room_name) => {
      log_line("[room] creating", &room_name);
      session.create_room(&room_name)?;
    }
    Action::Join(room_id) => {
      log_line("[room] joining", &room_id);
      session.join_room(&room_id)?;
    }
  }

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  tokio::pin!(runner);
  loop {
    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line.context("read stdin")? else {
          break;
        };
        if !handle_command(&session, line.trim()).await? {
          break;
        }
      }
      result = &mut runner => {
        log_line("[ws] closed", "signaling connection ended");
        result??;
        connection.shutdown();
        return Ok(());
      }
    }
  }

  if let Err(err) = session.leave_room().await {
    log_line("[room] leave failed", &err.to_string());
  }
  connection.shutdown();
  Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_command(session: &Arc<Session>, line: &str) -> Result<bool> {
  if line.is_empty() {
    return Ok(true);
  }
  let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
  let rest = rest.trim();
  match command {
    "/quit" => return Ok(false),
    "/send" => {
      let paths: Vec<PathBuf> = rest.split_whitespace().map(PathBuf::from).collect();
      if paths.is_empty() {
        log_line("[send] usage", "/send FILE...");
        return Ok(true);
      }
      match session.send_files(&paths).await {
        Ok(hashes) => {
          for hash in hashes {
            log_line("[send] queued", &hash);
          }
        }
        Err(err) => log_line("[send] failed", &format!("{err:#}")),
      }
    }
    "/cancel" if !rest.is_empty() => {
      session.cancel_file(rest).await;
      log_line("[send] cancelled", rest);
    }
    "/cancel-all" => {
      session.cancel_all().await;
      log_line("[send] cancelled", "all files");
    }
    "/peers" => {
      let peers = session.peers_info().await;
      if peers.is_empty() {
        log_line("[peers]", "none");
      }
      for (peer_id, info) in peers {
        log_line("[peers]", &format!("{peer_id} ({})", info.name.as_deref().unwrap_or("?")));
      }
    }
    "/clear" => {
      session.clear_received_buffers().await;
      session.clear_received_files().await;
      log_line("[recv] cleared", "buffers and files");
    }
    _ => session.send_chat(line).await,
  }
  Ok(true)
}

async fn spawn_event_log(session: &Arc<Session>) {
  let mut events = session.subscribe_events().await;
  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      match event {
        SessionEvent::RoomsUpdated(rooms) => log_line("[room] list", &rooms.to_string()),
        SessionEvent::JoinedRoom(room) => log_line(
          "[room] joined",
          &format!(
            "{} ({})",
            room.room_id.unwrap_or_default(),
            room.room_name.unwrap_or_default()
          ),
        ),
        SessionEvent::LeftRoom(room) => log_line("[room] left", &room.room_id.unwrap_or_default()),
        SessionEvent::RemoteTrack { peer_id, kind, .. } => log_line("[media] remote track", &format!("{kind} from {peer_id}")),
        SessionEvent::PeerConnectionState { peer_id, state } => log_line("[rtc] state", &format!("{peer_id}: {state}")),
        SessionEvent::SignalingClosed => log_line("[ws] closed", "no more signals"),
      }
    }
  });
}

async fn spawn_chat_log(session: &Arc<Session>) {
  let mut chat = session.subscribe_chat().await;
  tokio::spawn(async move {
    while let Some(message) = chat.recv().await {
      let from = message.peer_name.unwrap_or(message.peer_id);
      log_line(&format!("[chat] {from}"), &message.text);
    }
  });
}

/// Logs membership changes and sends the initial files once someone is there.
async fn spawn_peer_watch(session: &Arc<Session>, mut initial_files: Vec<PathBuf>) {
  let mut peers = session.subscribe_peers().await;
  let session = session.clone();
  tokio::spawn(async move {
    while let Some(info) = peers.recv().await {
      let names: Vec<String> = info
        .iter()
        .map(|(peer_id, peer)| peer.name.clone().unwrap_or_else(|| peer_id.clone()))
        .collect();
      log_line("[peers]", &format!("{} connected [{}]", names.len(), names.join(", ")));
      if info.is_empty() || initial_files.is_empty() {
        continue;
      }
      match session.send_files(&std::mem::take(&mut initial_files)).await {
        Ok(hashes) => log_line("[send] queued", &format!("{} file(s)", hashes.len())),
        Err(err) => log_line("[send] failed", &format!("{err:#}")),
      }
    }
  });
}

async fn spawn_progress_log(session: &Arc<Session>) {
  let mut sending = session.subscribe_sending().await;
  tokio::spawn(async move {
    let mut last_decile: HashMap<String, u64> = HashMap::new();
    let mut was_sending = false;
    while let Some(snapshot) = sending.recv().await {
      for (hash, entry) in &snapshot.files {
        if entry.cancelled || entry.meta.size == 0 {
          continue;
        }
        let decile = entry.min_progress * 10 / entry.meta.size;
        if last_decile.insert(hash.clone(), decile) != Some(decile) {
          log_line(
            "[send] progress",
            &format!(
              "{} {} / {}",
              entry.meta.name,
              format_bytes(entry.min_progress, 1),
              format_bytes(entry.meta.size, 1)
            ),
          );
        }
      }
      if was_sending && !snapshot.is_sending {
        log_line("[send] idle", "nothing in flight");
      }
      was_sending = snapshot.is_sending;
    }
  });
}

/// Saves every completed file into `output_dir` once.
async fn spawn_exporter(session: &Arc<Session>, output_dir: PathBuf) {
  let mut receiving = session.subscribe_receiving().await;
  tokio::spawn(async move {
    let mut saved: HashSet<FileKey> = HashSet::new();
    while let Some(snapshot) = receiving.recv().await {
      let exporters = snapshot
        .peers
        .values()
        .flat_map(|files| files.values())
        .filter_map(|entry| entry.exporter.clone());
      for exporter in exporters {
        if !saved.insert(exporter.key().clone()) {
          continue;
        }
        match exporter.save_to(&output_dir).await {
          Ok(path) => log_line("[recv] saved", &path.display().to_string()),
          Err(err) => log_line("[recv] save failed", &err.to_string()),
        }
      }
    }
  });
}

fn log_line(label: &str, value: &str) {
  let now = chrono::Utc::now().format("%H:%M:%S%.3f");
  println!("[{now}] {label}: {value}");
}
