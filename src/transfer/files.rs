use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// What a sender announces about a file before streaming it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
  pub name: String,
  #[serde(rename = "type")]
  pub mime: String,
  pub size: u64,
  pub last_modified: u64,
}

/// A local file queued for sending.
#[derive(Debug, Clone)]
pub struct SendFile {
  pub path: PathBuf,
  pub meta: FileMeta,
}

impl SendFile {
  pub async fn load(path: &Path) -> Result<Self> {
    let metadata = tokio::fs::metadata(path)
      .await
      .with_context(|| format!("stat {}", path.display()))?;
    if !metadata.is_file() {
      return Err(anyhow!("Not a regular file: {}", path.display()));
    }
    let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| anyhow!("Invalid file name"))?
      .to_string();
    let mime = mime_guess::from_path(path)
      .first_or_octet_stream()
      .essence_str()
      .to_string();
    let last_modified = metadata
      .modified()
      .ok()
      .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
      .map(|elapsed| elapsed.as_millis() as u64)
      .unwrap_or(0);
    Ok(Self {
      path: path.to_path_buf(),
      meta: FileMeta {
        name,
        mime,
        size: metadata.len(),
        last_modified,
      },
    })
  }

  /// Reads at most `len` bytes starting at `offset`; short only at EOF.
  pub async fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes> {
    let mut file = File::open(&self.path)
      .await
      .with_context(|| format!("open {}", self.path.display()))?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buffer).await?;
    Ok(Bytes::from(buffer))
  }
}

/// Derives file hashes from announced meta data plus a per-session stamp,
/// so the same file gets a new hash in a later session.
#[derive(Debug, Clone, Copy)]
pub struct ContentHasher {
  session_stamp: i64,
}

impl ContentHasher {
  /// Stamps with UTC midnight of the current day, in milliseconds.
  pub fn for_today() -> Self {
    let stamp = chrono::Utc::now()
      .date_naive()
      .and_hms_opt(0, 0, 0)
      .map(|midnight| midnight.and_utc().timestamp_millis())
      .unwrap_or(0);
    Self::with_stamp(stamp)
  }

  pub fn with_stamp(session_stamp: i64) -> Self {
    Self { session_stamp }
  }

  pub fn hash(&self, meta: &FileMeta) -> String {
    let input = format!(
      "{}{}{}{}{}",
      meta.name, meta.mime, meta.size, meta.last_modified, self.session_stamp
    );
    format!("{:x}", Sha256::digest(input.as_bytes()))
  }

  /// Hashes a batch, dropping repeats while keeping first-seen order.
  pub fn unique_files(&self, files: Vec<SendFile>) -> Vec<(String, SendFile)> {
    let mut seen = HashSet::new();
    files
      .into_iter()
      .filter_map(|file| {
        let hash = self.hash(&file.meta);
        seen.insert(hash.clone()).then_some((hash, file))
      })
      .collect()
  }
}

pub fn sanitize_file_name(name: &str) -> String {
  let candidate = Path::new(name)
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or("file");
  let trimmed = candidate.trim();
  if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
    "file".to_string()
  } else {
    trimmed.to_string()
  }
}

const SIZE_UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Human-readable size in powers of 1024, trailing zeros trimmed.
pub fn format_bytes(bytes: u64, decimals: usize) -> String {
  if bytes == 0 {
    return "0 Bytes".to_string();
  }
  let exponent = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
  let exponent = exponent.min(SIZE_UNITS.len() - 1);
  let value = bytes as f64 / 1024f64.powi(exponent as i32);
  let mut text = format!("{value:.decimals$}");
  if text.contains('.') {
    text = text.trim_end_matches('0').trim_end_matches('.').to_string();
  }
  format!("{text} {}", SIZE_UNITS[exponent])
}
