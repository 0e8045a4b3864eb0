//! One-time interpreter bootstrap.
//!
//! The first sandbox in a process compiles the prelude in a scratch state to
//! prove the embedded API is sound and records the interpreter version.
//! The work runs on the blocking pool and is memoized in a process-wide
//! [`OnceCell`], so concurrent callers await the same in-flight
//! initialization instead of bootstrapping twice.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use mlua::{Lua, LuaOptions, StdLib};
use tokio::sync::OnceCell;

/// Lua source of the `imagi` module, run once per script state.
pub(crate) const PRELUDE: &str = include_str!("prelude.lua");

static BOOTSTRAP: OnceCell<Bootstrap> = OnceCell::const_new();

/// Result of the process-wide bootstrap.
#[derive(Debug)]
pub struct Bootstrap {
    prelude: &'static str,
    lua_version: String,
    took: Duration,
}

impl Bootstrap {
    /// Prelude source every run loads.
    #[must_use]
    pub fn prelude(&self) -> &'static str {
        self.prelude
    }

    /// `_VERSION` reported by the embedded interpreter.
    #[must_use]
    pub fn lua_version(&self) -> &str {
        &self.lua_version
    }

    fn compile() -> Result<Self> {
        let started = Instant::now();
        let lua = new_state()?;
        lua.load(PRELUDE)
            .set_name("=imagi")
            .into_function()
            .map_err(|e| anyhow!("Failed to compile imagi prelude: {e}"))?;
        let lua_version: String = lua
            .globals()
            .get("_VERSION")
            .map_err(|e| anyhow!("Failed to read interpreter version: {e}"))?;

        Ok(Self {
            prelude: PRELUDE,
            lua_version,
            took: started.elapsed(),
        })
    }
}

/// Libraries available to learner code. The base library is always loaded.
pub(crate) fn sandbox_libs() -> StdLib {
    StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8
}

/// A fresh interpreter with only the sandboxed libraries opened.
pub(crate) fn new_state() -> Result<Lua> {
    Lua::new_with(sandbox_libs(), LuaOptions::new())
        .map_err(|e| anyhow!("Failed to create Lua state: {e}"))
}

/// Bootstrap the interpreter, or return the bootstrap already done.
///
/// # Errors
///
/// Returns an error if the prelude fails to compile or the blocking task
/// panics. A failed bootstrap is retried by the next caller.
pub async fn bootstrap() -> Result<&'static Bootstrap> {
    BOOTSTRAP
        .get_or_try_init(|| async {
            let bootstrap = tokio::task::spawn_blocking(Bootstrap::compile)
                .await
                .map_err(|e| anyhow!("Bootstrap task failed: {e}"))??;
            log::info!(
                "Interpreter ready ({}, {:?})",
                bootstrap.lua_version,
                bootstrap.took
            );
            Ok(bootstrap)
        })
        .await
}
