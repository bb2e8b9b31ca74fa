//! Client configuration: defaults, then a TOML file, then `MESHLANE_*`
//! environment variables. Command-line flags are applied last by the binary.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::transfer::{TransferOptions, DEFAULT_CHUNK_SIZE};

/// File: `~/.config/meshlane/config.toml` unless a path is given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Signaling endpoint; `http(s)` is rewritten to `ws(s)`.
  pub endpoint: String,
  pub display_name: String,
  /// STUN/TURN URLs.
  pub ice_servers: Vec<String>,
  /// Root of the on-disk chunk store.
  pub store_dir: PathBuf,
  pub fallback_chunk_size: usize,
  pub chunk_size_ceiling: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      endpoint: "ws://127.0.0.1:8080/socket".to_string(),
      display_name: std::env::var("USER").unwrap_or_else(|_| "meshlane".to_string()),
      ice_servers: vec!["stun:stun.cloudflare.com:3478".to_string()],
      store_dir: default_store_dir(),
      fallback_chunk_size: DEFAULT_CHUNK_SIZE,
      chunk_size_ceiling: 64 * 1024,
    }
  }
}

fn default_store_dir() -> PathBuf {
  match std::env::var_os("HOME") {
    Some(home) => PathBuf::from(home).join(".local/share/meshlane/store"),
    None => std::env::temp_dir().join("meshlane-store"),
  }
}

fn default_config_path() -> Option<PathBuf> {
  std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/meshlane/config.toml"))
}

impl Config {
  /// Loads `path` (which must exist) or the default file (which may not),
  /// then applies environment overrides.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let mut config = match path {
      Some(path) => Self::from_file(path)?,
      None => match default_config_path().filter(|path| path.exists()) {
        Some(path) => Self::from_file(&path)?,
        None => Self::default(),
      },
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_file(path: &Path) -> Result<Self> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
  }

  pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(endpoint) = lookup("MESHLANE_ENDPOINT") {
      self.endpoint = endpoint;
    }
    if let Some(name) = lookup("MESHLANE_NAME") {
      self.display_name = name;
    }
    if let Some(dir) = lookup("MESHLANE_STORE_DIR") {
      self.store_dir = PathBuf::from(dir);
    }
    if let Some(ceiling) = lookup("MESHLANE_CHUNK_CEILING") {
      self.chunk_size_ceiling = ceiling
        .parse()
        .with_context(|| format!("MESHLANE_CHUNK_CEILING is not a size: {ceiling}"))?;
    }
    Ok(())
  }

  pub fn validate(&self) -> Result<()> {
    if self.fallback_chunk_size == 0 || self.chunk_size_ceiling == 0 {
      return Err(anyhow!("chunk sizes must be positive"));
    }
    if self.display_name.trim().is_empty() {
      return Err(anyhow!("display name must not be empty"));
    }
    Ok(())
  }

  pub fn transfer_options(&self) -> TransferOptions {
    TransferOptions {
      fallback_chunk_size: self.fallback_chunk_size,
      chunk_size_ceiling: self.chunk_size_ceiling,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn partial_file_keeps_defaults() {
    let config: Config = toml::from_str(
      r#"
        endpoint = "https://signal.example.com/socket"
        chunk_size_ceiling = 32768
      "#,
    )
    .unwrap();
    assert_eq!(config.endpoint, "https://signal.example.com/socket");
    assert_eq!(config.chunk_size_ceiling, 32768);
    assert_eq!(config.fallback_chunk_size, DEFAULT_CHUNK_SIZE);
    assert_eq!(config.ice_servers, Config::default().ice_servers);
  }

  #[test]
  fn unknown_keys_are_rejected() {
    assert!(toml::from_str::<Config>("chunk_size = 1").is_err());
  }

  #[test]
  fn env_overrides_file_values() {
    let env = HashMap::from([
      ("MESHLANE_NAME", "Ada"),
      ("MESHLANE_CHUNK_CEILING", "8192"),
      ("MESHLANE_STORE_DIR", "/tmp/chunks"),
    ]);
    let mut config = Config::default();
    config
      .apply_env(|name| env.get(name).map(|value| value.to_string()))
      .unwrap();
    assert_eq!(config.display_name, "Ada");
    assert_eq!(config.store_dir, PathBuf::from("/tmp/chunks"));
    assert_eq!(config.transfer_options().chunk_size_ceiling, 8192);
  }

  #[test]
  fn bad_ceiling_is_an_error() {
    let mut config = Config::default();
    assert!(config
      .apply_env(|name| (name == "MESHLANE_CHUNK_CEILING").then(|| "lots".to_string()))
      .is_err());
  }

  #[test]
  fn load_reads_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "display_name = \"Grace\"\nfallback_chunk_size = 4096\n").unwrap();
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.display_name, "Grace");
    assert_eq!(config.transfer_options().fallback_chunk_size, 4096);
    assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
  }
}
