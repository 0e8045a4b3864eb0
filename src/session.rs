//! Learner portal session.
//!
//! Glues the pieces a coding page needs: code comes in from an editor or a
//! saved block, runs on the sandbox off the async runtime, is mirrored to
//! any companion display, reported to a run-event sink, and can then be sent
//! to the connected accessory.
//!
//! Script failures and device failures stay distinguishable: the former
//! carry the learner-facing script message, the latter always read
//! "Unable to send to imagiCharm.".

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::CodeMirror;
use crate::matrix::Frame;
use crate::playback;
use crate::sandbox::{Render, RunOutcome, Sandbox, ScriptError};
use crate::transport::{ImagiClient, TransportError};

/// Where a piece of code came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    /// A persisted lesson block.
    Block {
        /// Block identifier.
        id: String,
    },
    /// The free-form editor.
    Editor,
}

/// Code to run plus its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Where the code came from.
    pub source: CodeSource,
    /// Script text.
    pub code: String,
}

impl CodeBlock {
    /// Code typed into the editor.
    pub fn editor(code: impl Into<String>) -> Self {
        Self {
            source: CodeSource::Editor,
            code: code.into(),
        }
    }

    /// Code from a saved block.
    pub fn block(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            source: CodeSource::Block { id: id.into() },
            code: code.into(),
        }
    }

    /// Block id, when the code came from a block.
    pub fn block_id(&self) -> Option<&str> {
        match &self.source {
            CodeSource::Block { id } => Some(id),
            CodeSource::Editor => None,
        }
    }
}

/// Summary of one run, for progress tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// Block the code came from; `None` for the editor.
    pub block_id: Option<String>,
    /// Whether the script ran cleanly.
    pub success: bool,
    /// Learner-facing error on failure.
    pub error: Option<String>,
    /// Frames in the run's last render.
    pub frame_count: usize,
    /// Run time in milliseconds.
    pub elapsed_ms: u64,
    /// When the run finished.
    pub at: DateTime<Utc>,
}

/// Fire-and-forget receiver of run events.
pub trait RunEventSink: Send + Sync {
    /// Record `event`. Must not block.
    fn submit(&self, event: RunEvent);
}

/// Best-effort receiver of code as it is run.
pub trait CodeBroadcast: Send + Sync {
    /// Offer `block` to listeners; failures are swallowed.
    fn publish(&self, block: &CodeBlock);
}

impl CodeBroadcast for CodeMirror {
    fn publish(&self, block: &CodeBlock) {
        CodeMirror::publish(self, &block.code, block.block_id());
    }
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl RunEventSink for LogEventSink {
    fn submit(&self, event: RunEvent) {
        match &event.error {
            None => log::info!(
                "Run ok: {} frame(s) in {}ms",
                event.frame_count,
                event.elapsed_ms
            ),
            Some(error) => log::info!("Run failed: {error}"),
        }
    }
}

/// Why a session operation failed.
#[derive(Debug)]
pub enum SessionError {
    /// The learner's code failed.
    Script(ScriptError),
    /// The device could not be reached.
    Send(TransportError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script(e) => write!(f, "{e}"),
            Self::Send(_) => write!(f, "Unable to send to imagiCharm."),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Script(e) => Some(e),
            Self::Send(e) => Some(e),
        }
    }
}

/// One learner's coding session.
pub struct Session {
    sandbox: Arc<Sandbox>,
    client: Arc<ImagiClient>,
    events: Option<Arc<dyn RunEventSink>>,
    broadcast: Option<Arc<dyn CodeBroadcast>>,
    last_render: Mutex<Option<Render>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sandbox", &self.sandbox)
            .field("has_events", &self.events.is_some())
            .field("has_broadcast", &self.broadcast.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Session running on `sandbox` and sending through `client`.
    pub fn new(sandbox: Arc<Sandbox>, client: Arc<ImagiClient>) -> Self {
        Self {
            sandbox,
            client,
            events: None,
            broadcast: None,
            last_render: Mutex::new(None),
        }
    }

    /// Report every run to `sink`.
    #[must_use]
    pub fn with_events(mut self, sink: Arc<dyn RunEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Mirror every run's code to `broadcast`.
    #[must_use]
    pub fn with_broadcast(mut self, broadcast: Arc<dyn CodeBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// The accessory client.
    pub fn client(&self) -> &Arc<ImagiClient> {
        &self.client
    }

    /// The last successful render. Survives failed runs.
    pub fn last_render(&self) -> Option<Render> {
        self.last_render
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `block` on the sandbox.
    ///
    /// On failure the previous render stays current.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Script`] with the learner-facing message.
    pub async fn run(&self, block: CodeBlock) -> Result<RunOutcome, SessionError> {
        if let Some(broadcast) = &self.broadcast {
            broadcast.publish(&block);
        }

        let sandbox = Arc::clone(&self.sandbox);
        let code = block.code.clone();
        let result = tokio::task::spawn_blocking(move || sandbox.run(&code))
            .await
            .unwrap_or_else(|e| Err(ScriptError::Internal(format!("Script task failed: {e}"))));

        let (frame_count, elapsed) = match &result {
            Ok(outcome) => (
                outcome.last_render().map_or(0, |render| render.frames.len()),
                outcome.elapsed,
            ),
            Err(_) => (0, Duration::ZERO),
        };

        if let Ok(outcome) = &result {
            if let Some(render) = outcome.last_render() {
                *self
                    .last_render
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(render.clone());
            }
        }

        if let Some(events) = &self.events {
            events.submit(RunEvent {
                block_id: block.block_id().map(str::to_string),
                success: result.is_ok(),
                error: result.as_ref().err().map(ToString::to_string),
                frame_count,
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                at: Utc::now(),
            });
        }

        result.map_err(SessionError::Script)
    }

    /// Send the last successful render to the accessory. Nothing rendered
    /// yet is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Send`] if the accessory is not connected or
    /// a write fails.
    pub async fn send_to_device(&self) -> Result<(), SessionError> {
        let Some(render) = self.last_render() else {
            return Ok(());
        };
        self.client.send_render(&render).await.map_err(|e| {
            log::warn!("Send to device failed: {e}");
            SessionError::Send(e)
        })
    }

    /// Play the last successful render locally, one `on_frame` call per
    /// frame. Returns `false` when nothing has rendered yet.
    ///
    /// The playback is handed to the sandbox, so the next run or
    /// [`Session::dispose`] stops it.
    pub fn preview<F>(&self, on_frame: F) -> bool
    where
        F: FnMut(usize, &Frame) + Send + 'static,
    {
        let Some(render) = self.last_render() else {
            return false;
        };
        self.sandbox.attach_playback(playback::start(&render, on_frame));
        true
    }

    /// Stop any preview and release the sandbox's render callback.
    pub fn dispose(&self) {
        self.sandbox.dispose();
    }

    /// Run `block`, then send it if a device is connected.
    ///
    /// # Errors
    ///
    /// Script errors stop before sending; send errors are reported as
    /// [`SessionError::Send`].
    pub async fn run_and_send(&self, block: CodeBlock) -> Result<RunOutcome, SessionError> {
        let outcome = self.run(block).await?;
        if self.client.is_connected() {
            self.send_to_device().await?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxConfig;
    use crate::transport::loopback::{LoopbackCentral, LoopbackDevice};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<RunEvent>>,
        published: Mutex<Vec<String>>,
    }

    impl RunEventSink for Recorder {
        fn submit(&self, event: RunEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CodeBroadcast for Recorder {
        fn publish(&self, block: &CodeBlock) {
            self.published.lock().unwrap().push(block.code.clone());
        }
    }

    async fn session() -> (Session, Arc<LoopbackDevice>, Arc<Recorder>) {
        let sandbox = Arc::new(Sandbox::new(SandboxConfig::default()).await.unwrap());
        let device = LoopbackDevice::new("imagiCharm-test");
        let client = Arc::new(ImagiClient::new(LoopbackCentral::new(Arc::clone(&device))));
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(sandbox, client)
            .with_events(Arc::clone(&recorder) as Arc<dyn RunEventSink>)
            .with_broadcast(Arc::clone(&recorder) as Arc<dyn CodeBroadcast>);
        (session, device, recorder)
    }

    #[tokio::test]
    async fn test_failed_run_keeps_last_render() {
        let (session, _device, recorder) = session().await;

        session.run(CodeBlock::editor("background(red)")).await.unwrap();
        let before = session.last_render().unwrap();

        let err = session
            .run(CodeBlock::block("b2", "error('boom')"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Script(ScriptError::Runtime(_))));
        assert_eq!(session.last_render(), Some(before));

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].success);
        assert_eq!(events[0].frame_count, 1);
        assert!(!events[1].success);
        assert_eq!(events[1].block_id.as_deref(), Some("b2"));
        assert_eq!(recorder.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_send_error_is_distinct() {
        let (session, device, _recorder) = session().await;
        session.run(CodeBlock::editor("background(red)")).await.unwrap();

        let err = session.send_to_device().await.unwrap_err();
        assert_eq!(err.to_string(), "Unable to send to imagiCharm.");
        assert!(device.writes().is_empty());
    }

    #[tokio::test]
    async fn test_run_and_send_when_connected() {
        let (session, device, _recorder) = session().await;
        session.client().connect().await.unwrap();

        session
            .run_and_send(CodeBlock::editor("background(green)"))
            .await
            .unwrap();
        // One frame packet plus the footer.
        assert_eq!(device.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_preview_stops_on_next_run() {
        let (session, _device, _recorder) = session().await;
        assert!(!session.preview(|_, _| {}));

        session
            .run(CodeBlock::editor("background(red)\nrender(nil, 25)"))
            .await
            .unwrap();
        let frames = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&frames);
        assert!(session.preview(move |_, _| *sink.lock().unwrap() += 1));

        tokio::time::sleep(Duration::from_millis(120)).await;
        session.run(CodeBlock::editor("background(blue)")).await.unwrap();
        let stopped_at = *frames.lock().unwrap();
        assert!(stopped_at > 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*frames.lock().unwrap(), stopped_at);
        session.dispose();
    }
}
