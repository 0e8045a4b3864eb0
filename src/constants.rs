//! Protocol and runtime constants for the imagiCharm bridge.
//!
//! This module centralizes the magic numbers shared by the codec, the
//! sandbox, the transport client and the snippet renderer. Constants are
//! grouped by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Display**: Matrix geometry and frame duration bounds
//! - **Wire protocol**: Opcodes, packet sizes and quantization levels
//! - **Wireless link**: Service/characteristic identifiers and discovery filter
//! - **Sandbox**: Execution budget and interpreter limits
//! - **Snippets**: Documentation playback bounds
//! - **Mirror**: Live code mirror retry policy

use std::time::Duration;

use uuid::Uuid;

// ============================================================================
// Display
// ============================================================================

/// Width and height of the LED matrix, in pixels.
pub const MATRIX_SIZE: usize = 8;

/// Number of pixels in one matrix.
pub const PIXEL_COUNT: usize = MATRIX_SIZE * MATRIX_SIZE;

/// Shortest frame the firmware will display, in milliseconds.
pub const MIN_FRAME_DURATION_MS: u32 = 25;

/// Longest frame duration representable in the 24-bit duration field.
pub const MAX_FRAME_DURATION_MS: u32 = 0x00FF_FFFF;

/// Duration of a still picture rendered without an explicit animation.
pub const STILL_FRAME_DURATION_MS: u32 = 1000;

/// Loop count meaning "repeat forever".
pub const LOOP_FOREVER: u16 = 0;

/// Width of one glyph cell in the bitmap font (5 lit columns + 1 spacing).
pub const GLYPH_WIDTH: i32 = 6;

/// Number of glyphs visible at once while scrolling text.
pub const SCROLL_WINDOW: usize = 3;

// ============================================================================
// Wire protocol
// ============================================================================

/// Opcode shared by frame packets and the animation footer.
///
/// The firmware tells the two apart by length and stream position.
pub const OPCODE_ANIMATION: u8 = 0x11;

/// Opcode of the scrolling-text packet.
pub const OPCODE_SCROLLING_TEXT: u8 = 0x22;

/// Frame packet: opcode, index, 64 RGB triples, u24 duration.
pub const FRAME_PACKET_LEN: usize = 2 + PIXEL_COUNT * 3 + 3;

/// Footer packet: opcode, frame count, u16 loop count.
pub const FOOTER_PACKET_LEN: usize = 4;

/// Maximum number of text bytes carried by a scrolling-text packet.
pub const TEXT_PAYLOAD_LEN: usize = 100;

/// Reserved zero padding at the end of a scrolling-text packet.
pub const TEXT_RESERVED_LEN: usize = 88;

/// Scrolling-text packet: opcode, two colours, u24 duration, u16 loops,
/// text payload and reserved region.
pub const TEXT_PACKET_LEN: usize = 1 + 6 + 3 + 2 + TEXT_PAYLOAD_LEN + TEXT_RESERVED_LEN;

/// Brightness steps in normal mode.
pub const INDOOR_LEVELS: u8 = 9;

/// Brightness steps in outdoor (high-brightness) mode.
pub const OUTDOOR_LEVELS: u8 = 15;

/// Substitute byte for characters the firmware cannot display.
pub const NON_ASCII_SUBSTITUTE: u8 = b'?';

// ============================================================================
// Wireless link
// ============================================================================

/// GATT service exposed by the accessory.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4ced8831_02f6_439a_b89b_36f51cbc4feb);

/// Characteristic the client writes packets to.
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x4ced8832_02f6_439a_b89b_36f51cbc4feb);

/// Characteristic the accessory notifies on.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4ced8833_02f6_439a_b89b_36f51cbc4feb);

/// Advertised name prefix used to filter discovery results.
pub const DEVICE_NAME_PREFIX: &str = "imagiCharm";

// ============================================================================
// Sandbox
// ============================================================================

/// Wall-clock budget for one script execution.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default Lua heap ceiling for one script execution.
pub const SCRIPT_MEMORY_LIMIT: usize = 32 * 1024 * 1024;

/// Instruction interval of the timeout hook, in addition to line events.
///
/// Catches loops that never change line (`while true do end`).
pub const HOOK_INSTRUCTION_INTERVAL: u32 = 1000;

/// Per-step duration of `scrolling_text` when the script gives none.
pub const SCROLL_STEP_DURATION_MS: u32 = 100;

/// Frames one run may create in total.
///
/// Frame data is allocated by the host, outside the Lua heap limit.
pub const MAX_FRAMES_PER_RUN: usize = 8192;

// ============================================================================
// Snippets
// ============================================================================

/// Frames retained per documentation snippet.
pub const SNIPPET_MAX_FRAMES: usize = 256;

/// Upper duration bound for documentation playback.
pub const SNIPPET_MAX_FRAME_DURATION_MS: u32 = 4000;

/// Fixed display duration of a `grid` snippet.
pub const GRID_FRAME_DURATION_MS: u32 = 1000;

// ============================================================================
// Mirror
// ============================================================================

/// Connection attempts made by the live code mirror before giving up.
pub const MIRROR_MAX_ATTEMPTS: u32 = 3;

/// Linear backoff step between mirror connection attempts.
pub const MIRROR_BACKOFF_STEP: Duration = Duration::from_millis(500);
