//! Learner script sandbox.
//!
//! Runs untrusted Lua against a simulated 8x8 matrix and captures every
//! `render()` call as a frame list. Each run gets a fresh interpreter with a
//! trimmed standard library, a heap ceiling and a wall-clock budget enforced
//! from an interpreter hook.
//!
//! # Timeout
//!
//! The hook fires on every line transition and every
//! [`HOOK_INSTRUCTION_INTERVAL`] instructions. Once the deadline passes it
//! raises an error on every event, so even `pcall` cannot keep a runaway
//! loop alive. Worst-case overrun is one host call or one instruction batch.
//!
//! # One Run At A Time
//!
//! Render callbacks are wired through a context built per run rather than a
//! global. Runs on one [`Sandbox`] are serialized by an internal lock, and
//! [`Sandbox::is_active`] reports whether a run is in progress.
//!
//! # Example
//!
//! ```ignore
//! let sandbox = Sandbox::new(SandboxConfig::default()).await?;
//! let outcome = sandbox.run("background(red)")?;
//! assert_eq!(outcome.last_render().unwrap().frames.len(), 1);
//! ```

pub mod bootstrap;
pub mod normalize;
pub mod primitives;

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use mlua::{HookTriggers, VmState};

use crate::config::Config;
use crate::constants::{
    EXECUTION_TIMEOUT, HOOK_INSTRUCTION_INTERVAL, MAX_FRAMES_PER_RUN, SCRIPT_MEMORY_LIMIT,
};
use crate::matrix::Frame;
use crate::playback::PlaybackHandle;

pub use bootstrap::{bootstrap, Bootstrap};
pub use normalize::{normalize, NormalizedScript};

use normalize::CHUNK_NAME;
use primitives::{RunContext, SharedRenderCallback};

/// Callback receiving every render as the script issues it.
pub type RenderCallback = Box<dyn FnMut(&Render) + Send>;

/// Sandbox limits and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Wall-clock budget per run.
    pub timeout: Duration,
    /// Lua heap ceiling in bytes.
    pub memory_limit: usize,
    /// `outdoorMode` used when a render call omits it.
    pub outdoor_mode: bool,
    /// Frames a run may create across all its animations.
    pub max_frames: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: EXECUTION_TIMEOUT,
            memory_limit: SCRIPT_MEMORY_LIMIT,
            outdoor_mode: true,
            max_frames: MAX_FRAMES_PER_RUN,
        }
    }
}

impl From<&Config> for SandboxConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.timeout(),
            memory_limit: config.memory_limit,
            outdoor_mode: config.outdoor_mode,
            max_frames: MAX_FRAMES_PER_RUN,
        }
    }
}

/// One `render()` call, canonicalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Render {
    /// Frames in play order.
    pub frames: Vec<Frame>,
    /// Times to play; 0 means forever.
    pub loop_count: u32,
    /// Use the high-brightness profile when sending.
    pub outdoor_mode: bool,
}

/// Everything a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// The last render. Always present after a normal run.
    pub render: Option<Render>,
    /// How many times the script rendered.
    pub render_count: usize,
    /// Lines written with `print`.
    pub output: Vec<String>,
    /// Wall-clock run time.
    pub elapsed: Duration,
}

impl RunOutcome {
    /// The run's result: its last render.
    #[must_use]
    pub fn last_render(&self) -> Option<&Render> {
        self.render.as_ref()
    }

    /// Take the last render by value.
    #[must_use]
    pub fn into_last_render(self) -> Option<Render> {
        self.render
    }
}

/// Why a run failed, already phrased for the learner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// The script did not parse. Carries the interpreter message with
    /// learner line numbers.
    Syntax(String),
    /// The script exceeded its wall-clock budget.
    Timeout {
        /// Budget that was exceeded.
        budget: Duration,
    },
    /// The script raised an error while running.
    Runtime(String),
    /// The sandbox itself failed to set up.
    Internal(String),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(msg) | Self::Runtime(msg) => write!(f, "{msg}"),
            Self::Timeout { budget } => {
                let secs = budget.as_secs_f64();
                let unit = if (secs - 1.0).abs() < f64::EPSILON {
                    "second"
                } else {
                    "seconds"
                };
                write!(
                    f,
                    "Your code took longer than {secs} {unit} to run. Check for an infinite loop."
                )
            }
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Innermost cause of a Lua error, past callback and context wrappers.
fn innermost(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            innermost(cause)
        }
        other => other,
    }
}

/// Reduce a Lua error to the single line a learner should see: the last
/// non-empty line of the message, with any traceback removed.
pub(crate) fn runtime_message(err: &mlua::Error) -> String {
    let text = match innermost(err) {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::MemoryError(_) => "not enough memory".to_string(),
        other => other.to_string(),
    };
    let before_traceback = text.split("stack traceback:").next().unwrap_or_default();
    before_traceback
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("Unknown error")
        .to_string()
}

/// Script runner bound to one render callback and one playback slot.
pub struct Sandbox {
    config: SandboxConfig,
    bootstrap: &'static Bootstrap,
    on_render: SharedRenderCallback,
    playback: Mutex<Option<PlaybackHandle>>,
    run_lock: Mutex<()>,
    active: AtomicBool,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let has_callback = self.on_render.lock().map(|slot| slot.is_some()).unwrap_or(false);
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("has_render_callback", &has_callback)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox, bootstrapping the interpreter on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the process-wide bootstrap fails.
    pub async fn new(config: SandboxConfig) -> Result<Self> {
        let bootstrap = bootstrap().await?;
        Ok(Self {
            config,
            bootstrap,
            on_render: Arc::new(Mutex::new(None)),
            playback: Mutex::new(None),
            run_lock: Mutex::new(()),
            active: AtomicBool::new(false),
        })
    }

    /// Register the callback that receives every render.
    pub fn set_render_callback<F>(&self, callback: F)
    where
        F: FnMut(&Render) + Send + 'static,
    {
        if let Ok(mut slot) = self.on_render.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Hand over a playback started from this sandbox's frames.
    ///
    /// Any playback attached earlier is cancelled, and so is this one when
    /// the next run starts or the sandbox is disposed.
    pub fn attach_playback(&self, handle: PlaybackHandle) {
        if let Ok(mut slot) = self.playback.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.cancel();
            }
        }
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Release the render callback and cancel any attached playback.
    pub fn dispose(&self) {
        if let Ok(mut slot) = self.on_render.lock() {
            slot.take();
        }
        self.stop_playback();
        log::debug!("Sandbox disposed");
    }

    fn stop_playback(&self) {
        let handle = self.playback.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Run `code` to completion.
    ///
    /// Blocks the calling thread for up to the configured timeout; async
    /// callers should use `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns a [`ScriptError`] whose `Display` is the learner-facing
    /// message.
    pub fn run(&self, code: &str) -> Result<RunOutcome, ScriptError> {
        let _serial = self
            .run_lock
            .lock()
            .map_err(|e| ScriptError::Internal(format!("Sandbox lock poisoned: {e}")))?;
        self.active.store(true, Ordering::SeqCst);
        self.stop_playback();
        let _active = scopeguard::guard(&self.active, |active| {
            active.store(false, Ordering::SeqCst);
        });

        let script = normalize(code);
        let started = Instant::now();
        let ctx = RunContext::new(
            self.config.outdoor_mode,
            self.config.max_frames,
            Arc::clone(&self.on_render),
        );

        let lua = bootstrap::new_state().map_err(|e| ScriptError::Internal(format!("{e:#}")))?;
        primitives::install(&lua, self.bootstrap.prelude(), &ctx)
            .map_err(|e| ScriptError::Internal(format!("Failed to install imagi API: {e}")))?;
        lua.set_memory_limit(self.config.memory_limit)
            .map_err(|e| ScriptError::Internal(format!("Failed to set memory limit: {e}")))?;

        let timed_out = Rc::new(Cell::new(false));
        let deadline = started + self.config.timeout;
        let flag = Rc::clone(&timed_out);
        lua.set_hook(
            HookTriggers::new()
                .every_line()
                .every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_, _| {
                if flag.get() || Instant::now() >= deadline {
                    flag.set(true);
                    return Err(mlua::Error::runtime("execution budget exceeded"));
                }
                Ok(VmState::Continue)
            },
        );
        let lua = scopeguard::guard(lua, |lua| lua.remove_hook());

        let result = lua
            .load(script.source.as_str())
            .set_name(format!("={CHUNK_NAME}"))
            .exec();
        drop(lua);

        match result {
            Ok(()) => {
                let (render, render_count) = ctx.take_render();
                let outcome = RunOutcome {
                    render,
                    render_count,
                    output: ctx.take_output(),
                    elapsed: started.elapsed(),
                };
                log::debug!(
                    "Script finished in {:?} with {} render(s)",
                    outcome.elapsed,
                    outcome.render_count
                );
                Ok(outcome)
            }
            Err(err) => {
                let error = self.classify(&err, timed_out.get(), &script);
                log::debug!("Script failed after {:?}: {error}", started.elapsed());
                Err(error)
            }
        }
    }

    fn classify(&self, err: &mlua::Error, timed_out: bool, script: &NormalizedScript) -> ScriptError {
        if timed_out {
            return ScriptError::Timeout {
                budget: self.config.timeout,
            };
        }
        match err {
            mlua::Error::SyntaxError { message, .. } => {
                ScriptError::Syntax(script.adjust_message(message))
            }
            other => ScriptError::Runtime(script.adjust_message(&runtime_message(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = ScriptError::Timeout {
            budget: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "Your code took longer than 5 seconds to run. Check for an infinite loop."
        );
        let err = ScriptError::Timeout {
            budget: Duration::from_millis(200),
        };
        assert!(err.to_string().contains("0.2 seconds"));
    }

    #[test]
    fn test_runtime_message_strips_traceback() {
        let err = mlua::Error::RuntimeError(
            "script:4: boom\nstack traceback:\n\t[C]: in function 'error'".to_string(),
        );
        assert_eq!(runtime_message(&err), "script:4: boom");
    }

    #[test]
    fn test_runtime_message_unwraps_callback() {
        let err = mlua::Error::CallbackError {
            traceback: "stack traceback:\n\t[C]: in ?".to_string(),
            cause: Arc::new(mlua::Error::runtime("pixel (9, 0) is outside the 8x8 matrix")),
        };
        assert_eq!(runtime_message(&err), "pixel (9, 0) is outside the 8x8 matrix");
    }

    #[tokio::test]
    async fn test_run_without_render_still_renders() {
        let sandbox = Sandbox::new(SandboxConfig::default()).await.unwrap();
        let outcome = sandbox.run("m:set(0, 0, red)").unwrap();
        let render = outcome.last_render().unwrap();
        assert_eq!(render.frames.len(), 1);
        assert!(!sandbox.is_active());
    }

    #[tokio::test]
    async fn test_syntax_error_line_is_adjusted() {
        let sandbox = Sandbox::new(SandboxConfig::default()).await.unwrap();
        let err = sandbox.run("background(red)\nx = = 1").unwrap_err();
        match err {
            ScriptError::Syntax(msg) => assert!(msg.starts_with("script:2:"), "{msg}"),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runtime_error_line_is_adjusted() {
        let sandbox = Sandbox::new(SandboxConfig::default()).await.unwrap();
        let err = sandbox.run("local x = 1\nerror('nope')").unwrap_err();
        assert_eq!(err, ScriptError::Runtime("script:2: nope".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        let sandbox = Sandbox::new(SandboxConfig {
            timeout: Duration::from_millis(200),
            ..SandboxConfig::default()
        })
        .await
        .unwrap();
        let started = Instant::now();
        let err = sandbox.run("while true do end").unwrap_err();
        assert!(matches!(err, ScriptError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_pcall_cannot_swallow_timeout() {
        let sandbox = Sandbox::new(SandboxConfig {
            timeout: Duration::from_millis(100),
            ..SandboxConfig::default()
        })
        .await
        .unwrap();
        let err = sandbox
            .run("while true do pcall(function() while true do end end) end")
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_dispose_releases_callback() {
        let sandbox = Sandbox::new(SandboxConfig::default()).await.unwrap();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        sandbox.set_render_callback(move |_| *sink.lock().unwrap() += 1);

        sandbox.run("render()").unwrap();
        assert_eq!(*count.lock().unwrap(), 1);

        sandbox.dispose();
        sandbox.run("render()").unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    fn blank_frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|_| Frame::new(&crate::matrix::Matrix::new(), 25))
            .collect()
    }

    fn counting_playback(count: &Arc<Mutex<usize>>) -> PlaybackHandle {
        let sink = Arc::clone(count);
        crate::playback::play(blank_frames(2), 0, move |_, _| *sink.lock().unwrap() += 1)
    }

    #[tokio::test]
    async fn test_dispose_cancels_attached_playback() {
        let sandbox = Sandbox::new(SandboxConfig::default()).await.unwrap();
        let count = Arc::new(Mutex::new(0usize));
        sandbox.attach_playback(counting_playback(&count));

        tokio::time::sleep(Duration::from_millis(120)).await;
        sandbox.dispose();
        let stopped_at = *count.lock().unwrap();
        assert!(stopped_at > 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*count.lock().unwrap(), stopped_at);
    }

    #[tokio::test]
    async fn test_new_run_cancels_attached_playback() {
        let sandbox = Sandbox::new(SandboxConfig::default()).await.unwrap();
        let first = Arc::new(Mutex::new(0usize));
        sandbox.attach_playback(counting_playback(&first));
        let second = Arc::new(Mutex::new(0usize));
        // Attaching replaces and cancels the earlier playback.
        sandbox.attach_playback(counting_playback(&second));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*first.lock().unwrap(), 0);

        sandbox.run("render()").unwrap();
        let stopped_at = *second.lock().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*second.lock().unwrap(), stopped_at);
    }
}
