//! Best-effort signaling channels.
//!
//! Channels here carry nice-to-have traffic (live code mirroring) whose loss
//! must never reach the learner. They connect through a shared
//! [`ReconnectPolicy`] and give up silently once it is exhausted.
//!
//! # Architecture
//!
//! ```text
//! CodeMirror
//!     │  publish(code) ──► mpsc ──► mirror task ──► WebSocket (JSON text)
//!     │
//!     └── ReconnectPolicy::run (3 attempts, 500ms × attempt)
//!             └── gives up ──► ChannelState::GaveUp, publishes dropped
//! ```

pub mod mirror;
pub mod reconnect;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Connection state of a best-effort channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected and not trying.
    #[default]
    Disconnected,
    /// Working through the reconnect policy.
    Connecting,
    /// Connected and forwarding.
    Connected,
    /// Policy exhausted; the channel stays down.
    GaveUp,
}

/// Errors inside a channel task. Never surfaced to publishers.
#[derive(Debug)]
pub enum ChannelError {
    /// Failed to establish connection.
    ConnectionFailed(String),
    /// Failed to send message.
    SendFailed(String),
    /// Channel was closed.
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Connection state observable from outside the channel task.
#[derive(Debug, Default)]
pub struct SharedChannelState {
    state: RwLock<ChannelState>,
}

impl SharedChannelState {
    /// Create new shared state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub async fn get(&self) -> ChannelState {
        self.state.read().await.clone()
    }

    /// Set the state.
    pub async fn set(&self, new_state: ChannelState) {
        *self.state.write().await = new_state;
    }
}

pub use mirror::{CodeMirror, MirrorMessage};
pub use reconnect::ReconnectPolicy;
