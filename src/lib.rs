//! Peer-mesh layer over WebRTC: perfect negotiation per peer, chunked file
//! transfer with durable receive buffers, progress tracking and chat.

pub mod chat;
pub mod config;
pub mod listener;
pub mod media;
pub mod negotiation;
pub mod progress;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transfer;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::Config;
pub use session::{Session, SessionEvent};
