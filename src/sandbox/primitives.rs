//! Host bindings behind `require("imagi")`.
//!
//! Everything a script can touch is registered here against a per-run
//! [`RunContext`]. The context is passed into every binding by `Rc` when the
//! interpreter state is built, so render calls reach the sandbox that created
//! the state and never a process-wide pointer.
//!
//! # Lua surface
//!
//! ```lua
//! m:background(red)
//! m:set(3, 4, {255, 128, 0})
//! local anim = Animation(2)
//! anim:add_frame(m, 250)
//! anim:scrolling_text("Hi", white, off, 80)
//! render(anim)
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use mlua::prelude::*;

use super::{Render, RenderCallback};
use crate::constants::{
    LOOP_FOREVER, MATRIX_SIZE, SCROLL_STEP_DURATION_MS, STILL_FRAME_DURATION_MS,
};
use crate::matrix::{
    clamp_duration, colors, scrolling_frame_count, Animation, Frame, Matrix, MatrixError, Pixel,
};

/// Module name resolved by the sandbox `require`.
pub const MODULE_NAME: &str = "imagi";

/// Registry slot holding the module table built by the prelude.
const MODULE_KEY: &str = "imagi.module";

/// Globals removed from the base library before learner code runs.
const REMOVED_GLOBALS: [&str; 4] = ["load", "loadfile", "dofile", "collectgarbage"];

/// Render callback slot shared between a [`super::Sandbox`] and its runs.
pub(crate) type SharedRenderCallback = Arc<Mutex<Option<RenderCallback>>>;

// =============================================================================
// FrameBudget
// =============================================================================

/// Frames a run may still create.
///
/// Charged before any frame is built, so a single host call can never
/// allocate past the limit or outlast the timeout hook by more than one
/// budget's worth of drawing.
#[derive(Debug)]
pub(crate) struct FrameBudget {
    limit: usize,
    remaining: Cell<usize>,
}

impl FrameBudget {
    fn new(limit: usize) -> Rc<Self> {
        Rc::new(Self {
            limit,
            remaining: Cell::new(limit),
        })
    }

    fn charge(&self, frames: usize) -> LuaResult<()> {
        let remaining = self.remaining.get();
        if frames > remaining {
            return Err(LuaError::runtime(format!(
                "Too many frames: a script can create at most {} frames",
                self.limit
            )));
        }
        self.remaining.set(remaining - frames);
        Ok(())
    }
}

// =============================================================================
// RunContext
// =============================================================================

/// State owned by one script run.
pub(crate) struct RunContext {
    /// The live matrix exposed as `m`.
    canvas: Rc<RefCell<Matrix>>,
    /// The animation `render()` falls back to.
    current: RefCell<Rc<RefCell<Animation>>>,
    /// Frames left for `add_frame` and `scrolling_text`.
    budget: Rc<FrameBudget>,
    /// The most recent render; earlier ones only reach the callback.
    last_render: RefCell<Option<Render>>,
    render_count: Cell<usize>,
    /// Captured `print` lines.
    output: RefCell<Vec<String>>,
    /// Value of `outdoorMode` when a render omits it.
    outdoor_default: bool,
    on_render: SharedRenderCallback,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("render_count", &self.render_count.get())
            .field("output_lines", &self.output.borrow().len())
            .field("outdoor_default", &self.outdoor_default)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub(crate) fn new(
        outdoor_default: bool,
        max_frames: usize,
        on_render: SharedRenderCallback,
    ) -> Rc<Self> {
        Rc::new(Self {
            canvas: Rc::new(RefCell::new(Matrix::new())),
            current: RefCell::new(Rc::new(RefCell::new(Animation::new(0)))),
            budget: FrameBudget::new(max_frames),
            last_render: RefCell::new(None),
            render_count: Cell::new(0),
            output: RefCell::new(Vec::new()),
            outdoor_default,
            on_render,
        })
    }

    /// The last render and the number of render calls.
    pub(crate) fn take_render(&self) -> (Option<Render>, usize) {
        (self.last_render.take(), self.render_count.get())
    }

    pub(crate) fn take_output(&self) -> Vec<String> {
        self.output.take()
    }

    /// Deliver a render to the host callback, then keep it as the latest.
    fn record(&self, render: Render) {
        log::debug!(
            "render: {} frame(s), loop {}, outdoor {}",
            render.frames.len(),
            render.loop_count,
            render.outdoor_mode
        );
        if let Ok(mut slot) = self.on_render.lock() {
            if let Some(callback) = slot.as_mut() {
                callback(&render);
            }
        }
        self.render_count.set(self.render_count.get() + 1);
        *self.last_render.borrow_mut() = Some(render);
    }

    /// Turn whatever the script passed to `render` into one frame list.
    fn canonical_render(
        &self,
        target: LuaValue,
        blink_rate: f64,
        outdoor_mode: bool,
    ) -> LuaResult<Render> {
        let (frames, loop_count) = match target {
            LuaValue::Nil => {
                let current = self.current.borrow();
                let animation = current.borrow();
                if animation.is_empty() {
                    let canvas = self.canvas.borrow();
                    still_frames(&canvas, blink_rate)
                } else {
                    (animation.frames().to_vec(), animation.loop_count())
                }
            }
            LuaValue::UserData(ud) if ud.is::<AnimationHandle>() => {
                let handle = ud.borrow::<AnimationHandle>()?;
                let animation = handle.animation.borrow();
                (animation.frames().to_vec(), animation.loop_count())
            }
            LuaValue::UserData(ud) if ud.is::<MatrixHandle>() => {
                let handle = ud.borrow::<MatrixHandle>()?;
                let matrix = handle.0.borrow();
                still_frames(&matrix, blink_rate)
            }
            other => {
                return Err(LuaError::runtime(format!(
                    "render expects an Animation or a Matrix, got {}",
                    other.type_name()
                )))
            }
        };

        Ok(Render {
            frames,
            loop_count,
            outdoor_mode,
        })
    }
}

/// A still picture: one 1000 ms frame played once, or a forever-looping
/// on/off pair when `blink_rate` is positive.
fn still_frames(matrix: &Matrix, blink_rate: f64) -> (Vec<Frame>, u32) {
    if blink_rate > 0.0 {
        let duration = clamp_duration(blink_rate);
        (
            vec![Frame::new(matrix, duration), Frame::new(&Matrix::new(), duration)],
            u32::from(LOOP_FOREVER),
        )
    } else {
        (vec![Frame::new(matrix, STILL_FRAME_DURATION_MS)], 1)
    }
}

/// Loop counts arrive as arbitrary numbers; negatives and NaN mean forever.
fn loop_count_from(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}

fn cell(x: i64, y: i64) -> LuaResult<(usize, usize)> {
    let size = MATRIX_SIZE as i64;
    if (0..size).contains(&x) && (0..size).contains(&y) {
        Ok((x as usize, y as usize))
    } else {
        Err(LuaError::runtime(format!(
            "pixel ({x}, {y}) is outside the 8x8 matrix"
        )))
    }
}

// =============================================================================
// Colour conversion
// =============================================================================

impl FromLua for Pixel {
    fn from_lua(value: LuaValue, _: &Lua) -> LuaResult<Self> {
        let LuaValue::Table(table) = value else {
            return Err(LuaError::runtime(format!(
                "expected a colour like {{255, 0, 0}}, got {}",
                value.type_name()
            )));
        };
        let channel = |index: i64, key: &str| -> LuaResult<f64> {
            let positional: Option<f64> = table.raw_get(index)?;
            match positional {
                Some(v) => Ok(v),
                None => Ok(table.raw_get::<Option<f64>>(key)?.unwrap_or(0.0)),
            }
        };
        Ok(Self::from_components(
            channel(1, "r")?,
            channel(2, "g")?,
            channel(3, "b")?,
        ))
    }
}

impl IntoLua for Pixel {
    fn into_lua(self, lua: &Lua) -> LuaResult<LuaValue> {
        lua.create_sequence_from([self.r, self.g, self.b])
            .map(LuaValue::Table)
    }
}

// =============================================================================
// MatrixHandle
// =============================================================================

/// Lua-facing handle to a matrix. `m` shares the run's canvas; handles made
/// by `Matrix(...)` or `m:snapshot()` own a private copy.
#[derive(Debug)]
pub struct MatrixHandle(Rc<RefCell<Matrix>>);

impl MatrixHandle {
    fn detached(matrix: Matrix) -> Self {
        Self(Rc::new(RefCell::new(matrix)))
    }
}

impl FromLua for MatrixHandle {
    fn from_lua(value: LuaValue, _: &Lua) -> LuaResult<Self> {
        match value {
            LuaValue::UserData(ud) => {
                let handle = ud.borrow::<Self>()?;
                let inner = Rc::clone(&handle.0);
                Ok(Self(inner))
            }
            other => Err(LuaError::runtime(format!(
                "expected a Matrix, got {}",
                other.type_name()
            ))),
        }
    }
}

impl LuaUserData for MatrixHandle {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("background", |_, this, color: Pixel| {
            this.0.borrow_mut().background(color);
            Ok(())
        });

        // m:character(ch, color, xOffset) - only the first character is drawn.
        methods.add_method(
            "character",
            |_, this, (text, color, x_offset): (String, Pixel, Option<i64>)| {
                let ch = text.chars().next().unwrap_or(' ');
                let x_offset = x_offset
                    .unwrap_or(0)
                    .clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                this.0.borrow_mut().character(ch, color, x_offset);
                Ok(())
            },
        );

        methods.add_method("set", |_, this, (x, y, color): (i64, i64, Pixel)| {
            let (x, y) = cell(x, y)?;
            this.0.borrow_mut().set(x, y, color);
            Ok(())
        });

        methods.add_method("get", |_, this, (x, y): (i64, i64)| {
            let (x, y) = cell(x, y)?;
            let pixel = this.0.borrow().get(x, y).unwrap_or(Pixel::OFF);
            Ok(pixel)
        });

        methods.add_method("snapshot", |_, this, ()| {
            let copy = this.0.borrow().snapshot();
            Ok(Self::detached(copy))
        });

        methods.add_meta_method(LuaMetaMethod::ToString, |_, _, ()| Ok("Matrix(8x8)"));
    }
}

/// Build a matrix from `nil` (blank), another matrix, or an 8x8 table of
/// colours.
///
/// # Errors
///
/// Returns [`MatrixError::InvalidSource`] for any other shape or type.
pub fn matrix_from_value(value: LuaValue) -> Result<Matrix, MatrixError> {
    match value {
        LuaValue::Nil => Ok(Matrix::new()),
        LuaValue::UserData(ud) => {
            let handle = ud
                .borrow::<MatrixHandle>()
                .map_err(|e| MatrixError::InvalidSource(e.to_string()))?;
            let matrix = handle.0.borrow().snapshot();
            Ok(matrix)
        }
        LuaValue::Table(rows) => {
            if rows.raw_len() != MATRIX_SIZE {
                return Err(MatrixError::InvalidSource(format!(
                    "expected {MATRIX_SIZE} rows, got {}",
                    rows.raw_len()
                )));
            }
            let mut parsed = Vec::with_capacity(MATRIX_SIZE);
            for (y, row) in rows.sequence_values::<LuaValue>().enumerate() {
                let row = row.map_err(|e| MatrixError::InvalidSource(e.to_string()))?;
                let LuaValue::Table(row) = row else {
                    return Err(MatrixError::InvalidSource(format!(
                        "row {y} is a {}, expected a table",
                        row.type_name()
                    )));
                };
                let pixels = row
                    .sequence_values::<Pixel>()
                    .collect::<LuaResult<Vec<_>>>()
                    .map_err(|e| MatrixError::InvalidSource(format!("row {y}: {e}")))?;
                parsed.push(pixels);
            }
            Matrix::from_rows(&parsed)
        }
        other => Err(MatrixError::InvalidSource(format!(
            "expected an 8x8 table, got {}",
            other.type_name()
        ))),
    }
}

// =============================================================================
// AnimationHandle
// =============================================================================

/// Lua-facing handle to an animation under construction.
#[derive(Debug)]
pub struct AnimationHandle {
    animation: Rc<RefCell<Animation>>,
    /// The run's canvas, drawn on by `anim:scrolling_text`.
    canvas: Rc<RefCell<Matrix>>,
    budget: Rc<FrameBudget>,
}

impl AnimationHandle {
    fn new(animation: Rc<RefCell<Animation>>, ctx: &RunContext) -> Self {
        Self {
            animation,
            canvas: Rc::clone(&ctx.canvas),
            budget: Rc::clone(&ctx.budget),
        }
    }
}

impl LuaUserData for AnimationHandle {
    fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("loop_count", |_, this| {
            Ok(this.animation.borrow().loop_count())
        });
        fields.add_field_method_set("loop_count", |_, this, value: f64| {
            this.animation.borrow_mut().set_loop_count(loop_count_from(value));
            Ok(())
        });
        fields.add_field_method_get("frame_count", |_, this| Ok(this.animation.borrow().len()));
    }

    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        // anim:add_frame(matrix, duration) - matrix defaults to `m`.
        methods.add_method(
            "add_frame",
            |_, this, (matrix, duration): (Option<MatrixHandle>, Option<f64>)| {
                this.budget.charge(1)?;
                let duration = duration.map_or(STILL_FRAME_DURATION_MS, clamp_duration);
                let source = matrix.map_or_else(|| Rc::clone(&this.canvas), |h| h.0);
                let snapshot = source.borrow().snapshot();
                this.animation.borrow_mut().add_frame(&snapshot, duration);
                Ok(())
            },
        );

        methods.add_method(
            "scrolling_text",
            |_,
             this,
             (text, text_color, back_color, duration): (
                String,
                Option<Pixel>,
                Option<Pixel>,
                Option<f64>,
            )| {
                this.budget.charge(scrolling_frame_count(&text))?;
                let duration = duration.map_or(SCROLL_STEP_DURATION_MS, clamp_duration);
                let mut canvas = this.canvas.borrow_mut();
                this.animation.borrow_mut().append_scrolling_text(
                    &mut canvas,
                    &text,
                    text_color.unwrap_or(colors::WHITE),
                    back_color.unwrap_or(colors::BLACK),
                    duration,
                );
                Ok(())
            },
        );

        methods.add_method("clear", |_, this, ()| {
            this.animation.borrow_mut().clear();
            Ok(())
        });

        methods.add_meta_method(LuaMetaMethod::Len, |_, this, ()| {
            Ok(this.animation.borrow().len())
        });
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Prepare a fresh state: trim the standard library, capture `print`, run
/// the prelude against the host bindings and install `require`.
pub(crate) fn install(lua: &Lua, prelude: &str, ctx: &Rc<RunContext>) -> LuaResult<()> {
    restrict_globals(lua)?;
    register_print(lua, ctx)?;

    let host = host_table(lua, ctx)?;
    let module: LuaTable = lua.load(prelude).set_name("=imagi").call(host)?;
    lua.set_named_registry_value(MODULE_KEY, module)?;

    register_require(lua)
}

fn restrict_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(name, LuaValue::Nil)?;
    }
    let string: LuaTable = globals.get("string")?;
    string.raw_set("dump", LuaValue::Nil)?;
    Ok(())
}

fn register_print(lua: &Lua, ctx: &Rc<RunContext>) -> LuaResult<()> {
    let tostring: LuaFunction = lua.globals().get("tostring")?;
    let ctx = Rc::clone(ctx);
    let print = lua.create_function(move |_, args: LuaMultiValue| {
        let mut parts = Vec::with_capacity(args.len());
        for value in args {
            parts.push(tostring.call::<String>(value)?);
        }
        let line = parts.join("\t");
        log::debug!(target: "script", "{line}");
        ctx.output.borrow_mut().push(line);
        Ok(())
    })?;
    lua.globals().set("print", print)
}

fn register_require(lua: &Lua) -> LuaResult<()> {
    let require = lua.create_function(|lua, name: String| {
        if name != MODULE_NAME {
            return Err(LuaError::runtime(format!("module '{name}' not found")));
        }
        let module: LuaTable = lua.named_registry_value(MODULE_KEY)?;
        let globals = lua.globals();
        for pair in module.clone().pairs::<LuaValue, LuaValue>() {
            let (key, value) = pair?;
            globals.raw_set(key, value)?;
        }
        Ok(module)
    })?;
    lua.globals().set("require", require)
}

/// The `host` table handed to the prelude.
fn host_table(lua: &Lua, ctx: &Rc<RunContext>) -> LuaResult<LuaTable> {
    let host = lua.create_table()?;

    let palette = lua.create_table()?;
    for (name, pixel) in colors::NAMED {
        palette.set(name, pixel)?;
    }
    host.set("colors", palette)?;
    host.set("matrix", MatrixHandle(Rc::clone(&ctx.canvas)))?;
    host.set("outdoor_default", ctx.outdoor_default)?;
    host.set("scroll_duration", SCROLL_STEP_DURATION_MS)?;

    host.set(
        "new_matrix",
        lua.create_function(|_, source: LuaValue| {
            let matrix = matrix_from_value(source).map_err(LuaError::external)?;
            Ok(MatrixHandle::detached(matrix))
        })?,
    )?;

    let c = Rc::clone(ctx);
    host.set(
        "new_animation",
        lua.create_function(move |_, loop_count: Option<f64>| {
            let animation = Rc::new(RefCell::new(Animation::new(
                loop_count.map_or(0, loop_count_from),
            )));
            *c.current.borrow_mut() = Rc::clone(&animation);
            Ok(AnimationHandle::new(animation, &c))
        })?,
    )?;

    let c = Rc::clone(ctx);
    host.set(
        "scrolling_text",
        lua.create_function(
            move |_, (text, text_color, back_color, duration, loops): (String, Pixel, Pixel, f64, f64)| {
                c.budget.charge(scrolling_frame_count(&text))?;
                let current = Rc::clone(&c.current.borrow());
                {
                    let mut animation = current.borrow_mut();
                    let mut canvas = c.canvas.borrow_mut();
                    animation.clear();
                    animation.set_loop_count(loop_count_from(loops));
                    animation.append_scrolling_text(
                        &mut canvas,
                        &text,
                        text_color,
                        back_color,
                        clamp_duration(duration),
                    );
                }
                Ok(AnimationHandle::new(current, &c))
            },
        )?,
    )?;

    let c = Rc::clone(ctx);
    host.set(
        "render",
        lua.create_function(
            move |_, (target, blink_rate, outdoor_mode): (LuaValue, f64, bool)| {
                let render = c.canonical_render(target, blink_rate, outdoor_mode)?;
                c.record(render);
                Ok(())
            },
        )?,
    )?;

    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::colors::{BLUE, RED};

    fn state() -> (Lua, Rc<RunContext>) {
        let lua = Lua::new();
        let ctx = RunContext::new(true, 64, Arc::new(Mutex::new(None)));
        install(&lua, crate::sandbox::bootstrap::PRELUDE, &ctx).expect("install bindings");
        (lua, ctx)
    }

    #[test]
    fn test_pixel_accepts_both_table_forms() {
        let lua = Lua::new();
        let p: Pixel = lua.load("return {300, -1, 12.7}").eval().unwrap();
        assert_eq!(p, Pixel::new(255, 0, 12));
        let p: Pixel = lua.load("return {r = 1, b = 2}").eval().unwrap();
        assert_eq!(p, Pixel::new(1, 0, 2));
        assert!(lua.load("return 'red'").eval::<Pixel>().is_err());
    }

    #[test]
    fn test_require_installs_globals() {
        let (lua, _ctx) = state();
        lua.load(r#"require("imagi"); background(red)"#).exec().unwrap();
        let m: LuaAnyUserData = lua.globals().get("m").unwrap();
        let handle = m.borrow::<MatrixHandle>().unwrap();
        assert!(handle.0.borrow().pixels().all(|p| p == RED));
    }

    #[test]
    fn test_unknown_module_rejected() {
        let (lua, _ctx) = state();
        let err = lua.load(r#"require("os")"#).exec().unwrap_err();
        assert!(err.to_string().contains("module 'os' not found"));
    }

    #[test]
    fn test_removed_globals() {
        let (lua, _ctx) = state();
        let missing: bool = lua
            .load("return load == nil and dofile == nil and loadfile == nil and string.dump == nil")
            .eval()
            .unwrap();
        assert!(missing);
    }

    #[test]
    fn test_print_is_captured() {
        let (lua, ctx) = state();
        lua.load(r#"print("hello", 42)"#).exec().unwrap();
        assert_eq!(ctx.take_output(), vec!["hello\t42".to_string()]);
    }

    #[test]
    fn test_render_nil_is_still_of_canvas() {
        let (lua, ctx) = state();
        lua.load(r#"require("imagi"); m:set(1, 2, blue); render()"#).exec().unwrap();
        let (render, count) = ctx.take_render();
        let render = render.unwrap();
        assert_eq!(count, 1);
        assert_eq!(render.loop_count, 1);
        assert_eq!(render.frames.len(), 1);
        assert_eq!(render.frames[0].duration_ms(), 1000);
        assert_eq!(render.frames[0].snapshot().get(1, 2), Some(BLUE));
        assert!(render.outdoor_mode);
    }

    #[test]
    fn test_render_blink() {
        let (lua, ctx) = state();
        lua.load(r#"require("imagi"); background(red); render(nil, 300, false)"#)
            .exec()
            .unwrap();
        let render = ctx.take_render().0.unwrap();
        assert_eq!(render.loop_count, 0);
        assert_eq!(render.frames.len(), 2);
        assert!(render.frames[1].snapshot().pixels().all(Pixel::is_off));
        assert_eq!(render.frames[1].duration_ms(), 300);
        assert!(!render.outdoor_mode);
    }

    #[test]
    fn test_animation_accumulates() {
        let (lua, ctx) = state();
        lua.load(
            r#"
            require("imagi")
            local anim = Animation(3)
            background(red)
            anim:add_frame(m, 10)
            background(blue)
            anim:add_frame(m, 200)
            anim.loop_count = 4
            render(anim)
            "#,
        )
        .exec()
        .unwrap();
        let render = ctx.take_render().0.unwrap();
        assert_eq!(render.loop_count, 4);
        assert_eq!(render.frames[0].duration_ms(), 25);
        assert!(render.frames[0].snapshot().pixels().all(|p| p == RED));
        assert!(render.frames[1].snapshot().pixels().all(|p| p == BLUE));
    }

    #[test]
    fn test_matrix_constructor_validates_shape() {
        let (lua, _ctx) = state();
        let err = lua
            .load(r#"require("imagi"); Matrix({{1, 2, 3}})"#)
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("Invalid matrix source"));

        let ok: bool = lua
            .load(
                r#"
                local rows = {}
                for y = 1, 8 do
                  rows[y] = {}
                  for x = 1, 8 do rows[y][x] = {x * 10, y * 10, 0} end
                end
                local copy = Matrix(rows)
                return copy:get(7, 7)[1] == 80
                "#,
            )
            .eval()
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn test_set_out_of_range_errors() {
        let (lua, _ctx) = state();
        let err = lua.load(r#"require("imagi"); m:set(8, 0, red)"#).exec().unwrap_err();
        assert!(err.to_string().contains("outside the 8x8 matrix"));
    }

    #[test]
    fn test_render_callback_sees_each_render() {
        let lua = Lua::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: RenderCallback = Box::new(move |render: &Render| {
            sink.lock().unwrap().push(render.frames.len());
        });
        let ctx = RunContext::new(true, 64, Arc::new(Mutex::new(Some(callback))));
        install(&lua, crate::sandbox::bootstrap::PRELUDE, &ctx).unwrap();
        lua.load(r#"require("imagi"); render(); scrolling_text("A"); render()"#)
            .exec()
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 6]);
    }

    #[test]
    fn test_scrolling_text_is_charged_before_drawing() {
        let (lua, ctx) = state();
        // 11 characters need 66 frames, over the 64-frame budget.
        let err = lua
            .load(r#"require("imagi"); scrolling_text("hello world", red, off, 50, 1)"#)
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("Too many frames"), "{err}");
        assert!(ctx.current.borrow().borrow().is_empty());
        assert!(ctx.canvas.borrow().pixels().all(Pixel::is_off));
    }

    #[test]
    fn test_budget_spans_animations() {
        let (lua, _ctx) = state();
        let err = lua
            .load(
                r#"
                require("imagi")
                for i = 1, 10 do
                  local a = Animation()
                  for j = 1, 10 do a:add_frame(m, 50) end
                end
                "#,
            )
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("at most 64 frames"), "{err}");
    }

    #[test]
    fn test_only_last_render_is_kept() {
        let (lua, ctx) = state();
        lua.load(
            r#"
            require("imagi")
            local a = Animation()
            for i = 1, 8 do a:add_frame(m, 50) end
            for i = 1, 500 do render(a) end
            background(red)
            render()
            "#,
        )
        .exec()
        .unwrap();
        let (render, count) = ctx.take_render();
        assert_eq!(count, 501);
        let render = render.unwrap();
        assert_eq!(render.frames.len(), 1);
        assert!(render.frames[0].snapshot().pixels().all(|p| p == RED));
    }
}
