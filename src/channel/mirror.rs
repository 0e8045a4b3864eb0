//! Live code mirroring over WebSocket.
//!
//! When a learner runs a block, its source is pushed to a companion display
//! (a projector page, an instructor dashboard) as a JSON text frame. The
//! mirror is strictly best-effort: [`CodeMirror::publish`] never fails or
//! blocks, the connection goes through a [`ReconnectPolicy`], and once the
//! policy is exhausted the mirror stays silent for the rest of the session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::{ChannelError, ChannelState, ReconnectPolicy, SharedChannelState};
use crate::config::Config;

/// Messages queued while the socket is still connecting.
const QUEUE_DEPTH: usize = 32;

/// One mirrored run, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorMessage {
    /// Always `"code"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Block identifier, when the code came from an editor block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// Source exactly as the learner wrote it.
    pub code: String,
    /// When the run started.
    pub sent_at: DateTime<Utc>,
}

impl MirrorMessage {
    /// A code message stamped now.
    pub fn code(code: impl Into<String>, block_id: Option<&str>) -> Self {
        Self {
            kind: "code".to_string(),
            block_id: block_id.map(str::to_string),
            code: code.into(),
            sent_at: Utc::now(),
        }
    }
}

/// Handle to the background mirror task.
pub struct CodeMirror {
    url: String,
    tx: mpsc::Sender<MirrorMessage>,
    state: Arc<SharedChannelState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for CodeMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeMirror")
            .field("url", &self.url)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CodeMirror {
    /// Start mirroring to `url`. Must be called inside a tokio runtime.
    pub fn spawn(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let url = url.into();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let state = SharedChannelState::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_mirror(
            url.clone(),
            policy,
            Arc::clone(&state),
            rx,
            cancel.clone(),
        ));

        Self {
            url,
            tx,
            state,
            cancel,
            task,
        }
    }

    /// Mirror configured by `config.mirror_url`, if any.
    pub fn from_config(config: &Config) -> Option<Self> {
        let url = config.mirror_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(Self::spawn(url, ReconnectPolicy::from_config(config)))
    }

    /// Queue `code` for the companion display. Dropped silently when the
    /// queue is full or the mirror has given up.
    pub fn publish(&self, code: &str, block_id: Option<&str>) {
        if let Err(e) = self.tx.try_send(MirrorMessage::code(code, block_id)) {
            log::debug!("Mirror dropped a message: {e}");
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ChannelState {
        self.state.get().await
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CodeMirror {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_mirror(
    url: String,
    policy: ReconnectPolicy,
    state: Arc<SharedChannelState>,
    mut rx: mpsc::Receiver<MirrorMessage>,
    cancel: CancellationToken,
) {
    loop {
        state.set(ChannelState::Connecting).await;

        let socket = policy
            .run(&cancel, |attempt| {
                let url = url.clone();
                async move {
                    log::debug!("Mirror connecting to {url} (attempt {attempt})");
                    connect_async(url.as_str())
                        .await
                        .map(|(socket, _response)| socket)
                        .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))
                }
            })
            .await;

        let Some(socket) = socket else {
            if cancel.is_cancelled() {
                state.set(ChannelState::Disconnected).await;
            } else {
                log::info!("Mirror to {url} unavailable; continuing without it");
                state.set(ChannelState::GaveUp).await;
            }
            break;
        };

        log::info!("Mirror connected to {url}");
        state.set(ChannelState::Connected).await;

        let (mut write, mut read) = socket.split();
        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                }
                queued = rx.recv() => {
                    let Some(message) = queued else {
                        let _ = write.send(Message::Close(None)).await;
                        break None;
                    };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("Mirror failed to encode message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        break Some(ChannelError::SendFailed(e.to_string()));
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break Some(ChannelError::SendFailed(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Some(ChannelError::Closed),
                    Some(Err(e)) => break Some(ChannelError::ConnectionFailed(e.to_string())),
                    Some(Ok(_)) => {}
                }
            }
        };

        match reason {
            None => {
                state.set(ChannelState::Disconnected).await;
                break;
            }
            Some(e) => log::warn!("Mirror connection to {url} lost: {e}"),
        }
    }
}
