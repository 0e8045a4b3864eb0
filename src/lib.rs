//! imagi - script sandbox and wire protocol bridge for the imagiCharm.
//!
//! The imagiCharm is an 8x8 RGB LED accessory driven over a low-power
//! wireless link. This crate runs learner-written Lua against a simulated
//! matrix, captures what the script renders as timed frames, and encodes
//! those frames into the accessory's packet format.
//!
//! # Architecture
//!
//! ```text
//! code ──► sandbox ──► Render { frames, loop_count }
//!                          │
//!                          ├──► transport::ImagiClient ──► codec ──► accessory
//!                          ├──► playback (timed local preview)
//!                          └──► snippets (cached documentation previews)
//! ```
//!
//! # Modules
//!
//! - [`codec`] - Quantization and packet encoding
//! - [`matrix`] - Pixel grid, frames, animations, bitmap font
//! - [`sandbox`] - Lua execution with timeout and drawing API
//! - [`transport`] - Accessory discovery, connection and ordered writes
//! - [`playback`] - Cancellable frame schedules
//! - [`snippets`] - Documentation snippet rendering and cache
//! - [`channel`] - Reconnect policy and live code mirror
//! - [`session`] - Learner portal glue
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod channel;
pub mod codec;
pub mod commands;
pub mod matrix;
pub mod playback;
pub mod preview;
pub mod sandbox;
pub mod session;
pub mod snippets;
pub mod transport;

pub mod config;
pub mod constants;
pub mod env;

// Re-export commonly used types
pub use config::Config;
pub use matrix::{Animation, Frame, Matrix, Pixel};
pub use sandbox::{Render, RunOutcome, Sandbox, SandboxConfig, ScriptError};
pub use session::{CodeBlock, Session, SessionError};
pub use transport::{ImagiClient, TransportError};
