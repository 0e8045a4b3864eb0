//! Timed local playback of a captured render.
//!
//! A render becomes a schedule of per-frame callbacks, each due at the
//! cumulative duration of the frames before it. The whole schedule repeats
//! `loop_count` times (0 = forever) and is cancelled as one unit through the
//! returned [`PlaybackHandle`]. Once [`PlaybackHandle::cancel`] returns, no
//! callback from that schedule fires again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::matrix::Frame;
use crate::sandbox::Render;

/// Per-frame callback: frame index within the pass, and the frame.
pub type FrameCallback = Box<dyn FnMut(usize, &Frame) + Send>;

type CallbackSlot = Arc<Mutex<Option<FrameCallback>>>;

/// Handle to a running playback schedule.
///
/// Dropping the handle cancels the schedule.
pub struct PlaybackHandle {
    token: CancellationToken,
    slot: CallbackSlot,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl PlaybackHandle {
    /// Cancel every pending callback.
    ///
    /// Waits for a callback that is already running to return. Must not be
    /// called from inside the frame callback itself.
    pub fn cancel(&self) {
        self.token.cancel();
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }

    /// Whether the schedule was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that stops the schedule when cancelled, for callers that hand
    /// the handle itself to [`PlaybackHandle::wait`].
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the schedule has run to completion or stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the schedule to end, by completion or cancellation.
    pub async fn wait(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Playback task failed: {e}");
            }
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Play a sandbox render.
///
/// Must be called from within a tokio runtime.
pub fn start<F>(render: &Render, on_frame: F) -> PlaybackHandle
where
    F: FnMut(usize, &Frame) + Send + 'static,
{
    play(render.frames.clone(), render.loop_count, on_frame)
}

/// Schedule `frames` for playback, repeating `loop_count` times (0 = forever).
///
/// An empty frame list finishes immediately without calling `on_frame`.
/// Must be called from within a tokio runtime.
pub fn play<F>(frames: Vec<Frame>, loop_count: u32, on_frame: F) -> PlaybackHandle
where
    F: FnMut(usize, &Frame) + Send + 'static,
{
    let token = CancellationToken::new();
    let slot: CallbackSlot = Arc::new(Mutex::new(Some(Box::new(on_frame))));
    let task = tokio::spawn(run_schedule(
        frames,
        loop_count,
        token.clone(),
        Arc::clone(&slot),
    ));

    PlaybackHandle {
        token,
        slot,
        task: Some(task),
    }
}

/// Fire the callback unless the schedule was cancelled.
fn fire(slot: &CallbackSlot, index: usize, frame: &Frame) -> bool {
    let Ok(mut slot) = slot.lock() else {
        return false;
    };
    match slot.as_mut() {
        Some(callback) => {
            callback(index, frame);
            true
        }
        None => false,
    }
}

async fn run_schedule(
    frames: Vec<Frame>,
    loop_count: u32,
    token: CancellationToken,
    slot: CallbackSlot,
) {
    if frames.is_empty() {
        return;
    }

    let mut pass_start = Instant::now();
    let mut pass: u32 = 0;
    loop {
        let mut offset = Duration::ZERO;
        for (index, frame) in frames.iter().enumerate() {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep_until(pass_start + offset) => {}
            }
            if !fire(&slot, index, frame) {
                return;
            }
            offset += Duration::from_millis(u64::from(frame.duration_ms()));
        }

        pass_start += offset;
        pass = pass.saturating_add(1);
        if loop_count != 0 && pass >= loop_count {
            break;
        }
    }

    // Hold the last frame for its full duration before reporting completion.
    tokio::select! {
        () = token.cancelled() => {}
        () = tokio::time::sleep_until(pass_start) => {}
    }
    log::debug!("Playback finished after {pass} pass(es)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;

    fn frames(n: usize, ms: u32) -> Vec<Frame> {
        (0..n).map(|_| Frame::new(&Matrix::new(), ms)).collect()
    }

    #[tokio::test]
    async fn test_plays_every_frame_each_loop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = play(frames(3, 25), 2, move |index, _| {
            sink.lock().unwrap().push(index);
        });

        let started = std::time::Instant::now();
        handle.wait().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
        assert!(started.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn test_empty_frames_finish_immediately() {
        let handle = play(Vec::new(), 0, |_, _| panic!("no frames to play"));
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_callbacks() {
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let handle = play(frames(2, 25), 0, move |_, _| {
            *sink.lock().unwrap() += 1;
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.cancel();
        let after_cancel = *count.lock().unwrap();
        assert!(after_cancel >= 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*count.lock().unwrap(), after_cancel);
        assert!(handle.is_cancelled());
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        drop(play(frames(1, 1000), 0, move |_, _| {
            *sink.lock().unwrap() += 1;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(*count.lock().unwrap() <= 1);
    }
}
