//! Chunked file transfer over labeled sub-channels.
//!
//! One meta channel per batch announces `hash -> meta`; each file then gets
//! its own channel labeled `file-<hash>`, paced by the channel's
//! buffered-amount-low signal and bracketed by the text markers below.

pub mod files;
pub mod persist;
pub mod receiver;
pub mod sender;

pub use files::{format_bytes, sanitize_file_name, ContentHasher, FileMeta, SendFile};
pub use persist::PersistScheduler;
pub use receiver::FileReceiver;
pub use sender::{FileSender, TransferOptions};

pub const ACK_FOR_FILE_META_DATA_MESSAGE: &str = "ACK_FOR_FILE_META_DATA_MESSAGE";
pub const START_OF_FILE_BUFFER_MESSAGE: &str = "START_OF_FILE_BUFFER_MESSAGE";
pub const END_OF_FILE_BUFFER_MESSAGE: &str = "END_OF_FILE_BUFFER_MESSAGE";
pub const ACK_FOR_END_OF_FILE_BUFFER_MESSAGE: &str = "ACK_FOR_END_OF_FILE_BUFFER_MESSAGE";
pub const CANCEL_OF_FILE_BUFFER_MESSAGE: &str = "CANCEL_OF_FILE_BUFFER_MESSAGE";

pub const CHAT_MESSAGING_CHANNEL_LABEL: &str = "CHAT_MESSAGING_CHANNEL_LABEL";
pub const FILE_META_DATA_CHANNEL_LABEL: &str = "FILE_META_DATA_CHANNEL_LABEL";
const FILE_BUFFER_CHANNEL_PREFIX: &str = "file-";

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

pub fn file_channel_label(file_hash: &str) -> String {
  format!("{FILE_BUFFER_CHANNEL_PREFIX}{file_hash}")
}

/// What an inbound sub-channel carries, decided from its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPurpose {
  Chat,
  FileMeta,
  FileBuffer(String),
  Unknown,
}

impl ChannelPurpose {
  pub fn from_label(label: &str) -> Self {
    match label {
      CHAT_MESSAGING_CHANNEL_LABEL => Self::Chat,
      FILE_META_DATA_CHANNEL_LABEL => Self::FileMeta,
      other => match other.strip_prefix(FILE_BUFFER_CHANNEL_PREFIX) {
        Some(hash) if !hash.is_empty() => Self::FileBuffer(hash.to_string()),
        _ => Self::Unknown,
      },
    }
  }
}

/// Chunk size for a channel: its negotiated limit (or `fallback` when it
/// reports none), never above `ceiling`.
pub fn chunk_size_for(max_message_size: usize, fallback: usize, ceiling: usize) -> usize {
  let negotiated = if max_message_size > 0 { max_message_size } else { fallback };
  negotiated.min(ceiling).max(1)
}
