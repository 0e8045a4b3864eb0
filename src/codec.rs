//! imagiCharm wire protocol codec.
//!
//! Pure, deterministic conversion of matrices and text into the byte packets
//! the accessory firmware consumes. Nothing here fails: out-of-range numbers
//! are clamped or wrapped, because the inputs are arbitrary values computed
//! by learner scripts.
//!
//! # Packet Layout
//!
//! ```text
//! frame   [0x11, index, r0,g0,b0, ... r63,g63,b63, duration:u24be]   197 bytes
//! footer  [0x11, frameCount, loopCount:u16be]                          4 bytes
//! text    [0x22, tr,tg,tb, br,bg,bb, duration:u24be, loopCount:u16be,
//!          text[100], reserved[88]]                                  200 bytes
//! ```
//!
//! Frame packets and the footer share opcode `0x11`; the firmware tells them
//! apart by length. That convention is fixed by the device and kept as is.

use crate::constants::{
    FOOTER_PACKET_LEN, FRAME_PACKET_LEN, INDOOR_LEVELS, NON_ASCII_SUBSTITUTE, OPCODE_ANIMATION,
    OPCODE_SCROLLING_TEXT, OUTDOOR_LEVELS, PIXEL_COUNT, TEXT_PACKET_LEN, TEXT_PAYLOAD_LEN,
    TEXT_RESERVED_LEN,
};
use crate::matrix::{Matrix, Pixel};

/// Clamp an arbitrary number into a byte, truncating toward zero.
///
/// NaN maps to 0.
#[must_use]
pub fn clamp_byte(v: f64) -> u8 {
    if v.is_nan() || v <= 0.0 {
        0
    } else if v >= 255.0 {
        255
    } else {
        v.trunc() as u8
    }
}

/// Brightness levels for the selected display profile.
#[must_use]
pub fn levels_for(outdoor_mode: bool) -> u8 {
    if outdoor_mode {
        OUTDOOR_LEVELS
    } else {
        INDOOR_LEVELS
    }
}

/// Map an 8-bit channel onto `levels` device brightness steps.
///
/// Zero stays zero so unlit pixels remain fully off; any other value lands
/// in `1..=levels` with 255 mapping to `levels`.
#[must_use]
pub fn quantize_channel(v: u8, levels: u8) -> u8 {
    if v == 0 {
        return 0;
    }
    let scaled = 1.0 + f64::from(levels.saturating_sub(1)) * f64::from(v - 1) / 254.0;
    scaled.round() as u8
}

fn quantize_pixel(pixel: Pixel, levels: u8) -> [u8; 3] {
    [
        quantize_channel(pixel.r, levels),
        quantize_channel(pixel.g, levels),
        quantize_channel(pixel.b, levels),
    ]
}

/// Big-endian 16-bit encoding, wrapping modulo 2^16.
#[must_use]
pub fn u16be(v: u32) -> [u8; 2] {
    ((v & 0xFFFF) as u16).to_be_bytes()
}

/// Big-endian 24-bit encoding, wrapping modulo 2^24.
#[must_use]
pub fn u24be(v: u32) -> [u8; 3] {
    let [_, hi, mid, lo] = v.to_be_bytes();
    [hi, mid, lo]
}

/// ASCII bytes for the firmware font; anything above 0x7F becomes `?`.
#[must_use]
pub fn ascii_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| u8::try_from(ch).ok().filter(u8::is_ascii).unwrap_or(NON_ASCII_SUBSTITUTE))
        .collect()
}

/// Encode one animation frame.
///
/// The index is taken modulo 256 and pixels are flattened row-major.
#[must_use]
pub fn build_frame_packet(index: usize, matrix: &Matrix, duration_ms: u32, outdoor_mode: bool) -> Vec<u8> {
    let levels = levels_for(outdoor_mode);
    let mut packet = Vec::with_capacity(FRAME_PACKET_LEN);
    packet.push(OPCODE_ANIMATION);
    packet.push((index % 256) as u8);
    for pixel in matrix.pixels() {
        packet.extend_from_slice(&quantize_pixel(pixel, levels));
    }
    packet.extend_from_slice(&u24be(duration_ms));
    debug_assert_eq!(packet.len(), 2 + PIXEL_COUNT * 3 + 3);
    packet
}

/// Encode the footer that starts playback of the frames sent before it.
#[must_use]
pub fn build_animation_footer(frame_count: usize, loop_count: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(FOOTER_PACKET_LEN);
    packet.push(OPCODE_ANIMATION);
    packet.push((frame_count % 256) as u8);
    packet.extend_from_slice(&u16be(loop_count));
    packet
}

/// Parameters of a scrolling-text packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollingTextOptions {
    /// Text to scroll; truncated to 100 characters on the wire.
    pub text: String,
    /// Glyph colour.
    pub text_color: Pixel,
    /// Background colour.
    pub back_color: Pixel,
    /// Per-step duration in milliseconds.
    pub duration_ms: u32,
    /// Times to scroll; 0 means forever.
    pub loop_count: u32,
    /// Use the high-brightness profile.
    pub outdoor_mode: bool,
}

/// Encode a scrolling-text request rendered by the firmware itself.
#[must_use]
pub fn build_scrolling_text_packet(opts: &ScrollingTextOptions) -> Vec<u8> {
    let levels = levels_for(opts.outdoor_mode);
    let mut packet = Vec::with_capacity(TEXT_PACKET_LEN);
    packet.push(OPCODE_SCROLLING_TEXT);
    packet.extend_from_slice(&quantize_pixel(opts.text_color, levels));
    packet.extend_from_slice(&quantize_pixel(opts.back_color, levels));
    packet.extend_from_slice(&u24be(opts.duration_ms));
    packet.extend_from_slice(&u16be(opts.loop_count));

    let mut text = ascii_bytes(&opts.text);
    text.truncate(TEXT_PAYLOAD_LEN);
    text.resize(TEXT_PAYLOAD_LEN, 0);
    packet.extend_from_slice(&text);
    packet.resize(packet.len() + TEXT_RESERVED_LEN, 0);
    packet
}

/// A packet as the firmware interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPacket {
    /// One quantized frame.
    Frame {
        /// Frame slot (modulo 256).
        index: u8,
        /// 64 quantized RGB triples, row-major.
        levels: Vec<[u8; 3]>,
        /// Duration in milliseconds.
        duration_ms: u32,
    },
    /// Start playback of the stored frames.
    Footer {
        /// Number of frames to play (modulo 256).
        frame_count: u8,
        /// Loop count (modulo 2^16).
        loop_count: u16,
    },
    /// Firmware-rendered scrolling text.
    ScrollingText {
        /// Quantized text colour.
        text_levels: [u8; 3],
        /// Quantized background colour.
        back_levels: [u8; 3],
        /// Per-step duration.
        duration_ms: u32,
        /// Loop count.
        loop_count: u16,
        /// Text payload without zero padding.
        text: Vec<u8>,
    },
}

fn read_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

/// Interpret a packet the way the firmware does: by opcode and length.
///
/// Returns `None` for anything the firmware would ignore.
#[must_use]
pub fn decode_packet(packet: &[u8]) -> Option<DecodedPacket> {
    match (packet.first().copied()?, packet.len()) {
        (OPCODE_ANIMATION, FRAME_PACKET_LEN) => Some(DecodedPacket::Frame {
            index: packet[1],
            levels: packet[2..2 + PIXEL_COUNT * 3]
                .chunks_exact(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect(),
            duration_ms: read_u24(&packet[FRAME_PACKET_LEN - 3..]),
        }),
        (OPCODE_ANIMATION, FOOTER_PACKET_LEN) => Some(DecodedPacket::Footer {
            frame_count: packet[1],
            loop_count: u16::from_be_bytes([packet[2], packet[3]]),
        }),
        (OPCODE_SCROLLING_TEXT, TEXT_PACKET_LEN) => {
            let text_region = &packet[12..12 + TEXT_PAYLOAD_LEN];
            let end = text_region.iter().position(|b| *b == 0).unwrap_or(TEXT_PAYLOAD_LEN);
            Some(DecodedPacket::ScrollingText {
                text_levels: [packet[1], packet[2], packet[3]],
                back_levels: [packet[4], packet[5], packet[6]],
                duration_ms: read_u24(&packet[7..10]),
                loop_count: u16::from_be_bytes([packet[10], packet[11]]),
                text: text_region[..end].to_vec(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::colors::{BLUE, RED, WHITE};

    #[test]
    fn test_clamp_byte() {
        assert_eq!(clamp_byte(f64::NAN), 0);
        assert_eq!(clamp_byte(-4.0), 0);
        assert_eq!(clamp_byte(300.0), 255);
        assert_eq!(clamp_byte(12.9), 12);
        assert_eq!(clamp_byte(255.0), 255);
    }

    #[test]
    fn test_quantize_endpoints() {
        for levels in [INDOOR_LEVELS, OUTDOOR_LEVELS] {
            assert_eq!(quantize_channel(0, levels), 0);
            assert_eq!(quantize_channel(1, levels), 1);
            assert_eq!(quantize_channel(255, levels), levels);
        }
    }

    #[test]
    fn test_quantize_monotonic() {
        for levels in [INDOOR_LEVELS, OUTDOOR_LEVELS] {
            let mut last = 0;
            for v in 0..=255u8 {
                let q = quantize_channel(v, levels);
                assert!(q >= last, "{v} -> {q} dropped below {last}");
                assert!(q <= levels);
                last = q;
            }
        }
    }

    #[test]
    fn test_quantize_midpoint() {
        // 1 + 8 * 127 / 254 = 5
        assert_eq!(quantize_channel(128, INDOOR_LEVELS), 5);
        // 1 + 14 * 127 / 254 = 8
        assert_eq!(quantize_channel(128, OUTDOOR_LEVELS), 8);
    }

    #[test]
    fn test_u16_u24_wrap() {
        assert_eq!(u16be(70_000), [0x11, 0x70]);
        assert_eq!(u24be(0x0102_0304), [0x02, 0x03, 0x04]);
        assert_eq!(u24be(1000), [0x00, 0x03, 0xE8]);
    }

    #[test]
    fn test_ascii_bytes_substitutes() {
        assert_eq!(ascii_bytes("café"), vec![0x63, 0x61, 0x66, 0x3f]);
        assert_eq!(ascii_bytes("😀A"), vec![0x3f, 0x41]);
    }

    #[test]
    fn test_frame_packet_shape() {
        let mut m = Matrix::new();
        m.background(WHITE);
        m.set(0, 0, RED);
        let packet = build_frame_packet(300, &m, 1000, true);
        assert_eq!(packet.len(), 197);
        assert_eq!(packet[0], 0x11);
        assert_eq!(packet[1], 44);
        assert_eq!(&packet[2..5], &[15, 0, 0]);
        assert_eq!(&packet[5..8], &[15, 15, 15]);
        assert_eq!(&packet[194..], &[0x00, 0x03, 0xE8]);
    }

    #[test]
    fn test_frame_packet_indoor_levels() {
        let mut m = Matrix::new();
        m.background(BLUE);
        let packet = build_frame_packet(0, &m, 25, false);
        assert_eq!(&packet[2..5], &[0, 0, 9]);
    }

    #[test]
    fn test_footer_wraps() {
        assert_eq!(build_animation_footer(300, 70_000), vec![0x11, 44, 0x11, 0x70]);
    }

    #[test]
    fn test_scrolling_text_packet_truncates() {
        let opts = ScrollingTextOptions {
            text: "A".repeat(150),
            text_color: RED,
            back_color: Pixel::OFF,
            duration_ms: 100,
            loop_count: 2,
            outdoor_mode: false,
        };
        let packet = build_scrolling_text_packet(&opts);
        assert_eq!(packet.len(), 200);
        assert_eq!(packet[0], 0x22);
        assert_eq!(&packet[1..7], &[9, 0, 0, 0, 0, 0]);
        assert_eq!(&packet[7..10], &[0, 0, 100]);
        assert_eq!(&packet[10..12], &[0, 2]);
        assert!(packet[12..112].iter().all(|b| *b == 0x41));
        assert!(packet[112..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_scrolling_text_packet_pads_short_text() {
        let opts = ScrollingTextOptions {
            text: "Hi".to_string(),
            text_color: WHITE,
            back_color: Pixel::OFF,
            duration_ms: 50,
            loop_count: 0,
            outdoor_mode: true,
        };
        let packet = build_scrolling_text_packet(&opts);
        assert_eq!(packet.len(), 200);
        assert_eq!(&packet[12..14], b"Hi");
        assert!(packet[14..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_distinguishes_by_length() {
        let frame = build_frame_packet(3, &Matrix::new(), 40, true);
        let footer = build_animation_footer(1, 0);
        assert!(matches!(
            decode_packet(&frame),
            Some(DecodedPacket::Frame { index: 3, duration_ms: 40, .. })
        ));
        assert_eq!(
            decode_packet(&footer),
            Some(DecodedPacket::Footer { frame_count: 1, loop_count: 0 })
        );
        assert_eq!(decode_packet(&[0x11, 0, 0]), None);
        assert_eq!(decode_packet(&[]), None);
    }
}
