// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RFB wire format: protocol constants, fixed-layout structures, and the
//! stateless codec shared by the server and client roles.
//!
//! All multi-byte integers are big-endian on the wire. Decode functions are
//! non-destructive: they borrow the buffer, return `Ok(None)` while it does
//! not yet hold a complete unit, and on success report how many bytes the
//! caller should advance. This lets a session retry the same decode against
//! an accumulating buffer without double-parsing.
//!
//! The subset implemented here is intentionally narrow: protocol version 3.8,
//! security type None, true-colour 32-bit pixels, and a single full-surface
//! raw rectangle per framebuffer update.

use crate::error::{Result, RfbError};
use bytes::{Buf, BufMut, BytesMut};

/// The RFB protocol version string exchanged by both roles.
///
/// Must be exactly 12 bytes including the newline, as required by the RFB
/// protocol.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Upper bound on the desktop-name length a client will accept in ServerInit.
///
/// A declared length above this is treated as a protocol violation rather
/// than something to buffer for.
pub const MAX_NAME_LEN: u32 = 4096;

// Client-to-Server Message Types

/// Message type: Client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: Client sends a keyboard event. Recognized but not handled;
/// the server skips past it.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: Client sends a pointer (mouse) event. Recognized but not
/// handled; the server skips past it.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: Client sends cut text (clipboard data). Recognized but not
/// handled; the server skips past it.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Message type: Server sends a framebuffer update.
///
/// The only server-to-client message this engine emits.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

// Encoding Types

/// Encoding type: Raw pixel data.
///
/// Uncompressed pixel bytes in row-major order. The only encoding this
/// engine speaks, on both ends.
pub const ENCODING_RAW: i32 = 0;

// Security Types

/// Security type: None (no authentication).
///
/// The connection proceeds directly to the initialization phase. The only
/// security type this engine offers or accepts.
pub const SECURITY_TYPE_NONE: u8 = 1;

// Security Results

/// Security result: handshake successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Returns the 12-byte protocol version banner.
#[must_use]
pub fn encode_protocol_banner() -> &'static [u8; 12] {
    b"RFB 003.008\n"
}

/// Represents the pixel format of the RFB framebuffer.
///
/// This engine does not negotiate: both roles use the fixed format from
/// [`PixelFormat::rfb`]. The full structure is kept because it travels
/// inside ServerInit as a 16-byte block (13 meaningful bytes plus 3 of
/// padding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits per pixel.
    pub bits_per_pixel: u8,
    /// Depth of the pixel in bits.
    pub depth: u8,
    /// Flag indicating if the pixel data is big-endian (1) or little-endian (0).
    pub big_endian_flag: u8,
    /// Flag indicating if the pixel format is true-colour (1) or colormapped (0).
    pub true_colour_flag: u8,
    /// Maximum red color value.
    pub red_max: u16,
    /// Maximum green color value.
    pub green_max: u16,
    /// Maximum blue color value.
    pub blue_max: u16,
    /// Number of shifts to apply to get the red color component.
    pub red_shift: u8,
    /// Number of shifts to apply to get the green color component.
    pub green_shift: u8,
    /// Number of shifts to apply to get the blue color component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The fixed pixel format this engine advertises: 32 bits per pixel,
    /// 24-bit depth, little-endian, true colour, 8 bits per channel with
    /// red in the high byte of the colour value.
    #[must_use]
    pub fn rfb() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Serializes the pixel format as the 16-byte wire block.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Deserializes a pixel format from a 16-byte wire block.
    ///
    /// # Errors
    ///
    /// Returns [`RfbError::TruncatedInput`] if `buf` holds fewer than
    /// 16 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(RfbError::TruncatedInput);
        }
        let mut buf = &buf[..16];
        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        Ok(pf)
    }
}

/// The ServerInit message sent once security negotiation completes.
///
/// Provides the client with framebuffer dimensions, pixel format, and the
/// desktop name. The client sizes its local image from the dimensions here.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub width: u16,
    /// The height of the framebuffer in pixels.
    pub height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The desktop name.
    pub name: String,
}

impl ServerInit {
    /// Serializes the ServerInit message:
    /// 2-byte width, 2-byte height, 16-byte pixel format, 4-byte name
    /// length, then the name bytes. No trailing padding.
    #[allow(clippy::cast_possible_truncation)] // name length limited to u32 per RFB
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// Encodes a complete ServerInit block.
#[must_use]
pub fn encode_server_init(width: u16, height: u16, pixel_format: &PixelFormat, name: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24 + name.len());
    ServerInit {
        width,
        height,
        pixel_format: pixel_format.clone(),
        name: name.to_string(),
    }
    .write_to(&mut buf);
    buf
}

/// Decodes a ServerInit block from the front of `buf`.
///
/// Returns `Ok(None)` until the fixed 24-byte prefix and the declared name
/// bytes are all buffered.
///
/// # Errors
///
/// Returns [`RfbError::ProtocolViolation`] if the declared name length
/// exceeds [`MAX_NAME_LEN`].
pub fn decode_server_init(buf: &[u8]) -> Result<Option<(ServerInit, usize)>> {
    if buf.len() < 24 {
        return Ok(None);
    }
    let width = u16::from_be_bytes([buf[0], buf[1]]);
    let height = u16::from_be_bytes([buf[2], buf[3]]);
    let pixel_format = PixelFormat::from_bytes(&buf[4..20])?;
    let name_len = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
    if name_len > MAX_NAME_LEN {
        return Err(RfbError::ProtocolViolation(format!(
            "ServerInit name length {name_len} exceeds limit"
        )));
    }
    let total = 24 + name_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let name = String::from_utf8_lossy(&buf[24..total]).into_owned();
    Ok(Some((
        ServerInit {
            width,
            height,
            pixel_format,
            name,
        },
        total,
    )))
}

/// Decodes the security-type list the server offers.
///
/// The wire layout is a 1-byte count followed by that many type bytes.
///
/// # Errors
///
/// Returns [`RfbError::TruncatedInput`] if `buf` is empty or holds fewer
/// type bytes than the declared count requires. Callers advancing an
/// accumulating buffer should length-check first (`1 + count` bytes) so a
/// short buffer means malformed input, not input still in flight.
pub fn decode_security_types(buf: &[u8]) -> Result<(u8, Vec<u8>)> {
    let Some(&count) = buf.first() else {
        return Err(RfbError::TruncatedInput);
    };
    let end = 1 + count as usize;
    if buf.len() < end {
        return Err(RfbError::TruncatedInput);
    }
    Ok((count, buf[1..end].to_vec()))
}

/// A rectangle header inside a framebuffer update.
///
/// This engine always sends and expects exactly one rectangle per update,
/// covering the whole surface, in raw encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
    /// The encoding type used for this rectangle's pixel data.
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the 12-byte rectangle header: x, y, width, height as u16 and
    /// the encoding as i32.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

/// Encodes a complete framebuffer update message: the 4-byte update header
/// (type, padding, rectangle count fixed to 1), one 12-byte rectangle
/// header, and the raw pixel block.
///
/// `pixels` must be `width * height * 4` bytes of row-major RGBA data; the
/// server's capture path guarantees this.
#[must_use]
pub fn encode_framebuffer_update(
    x: u16,
    y: u16,
    width: u16,
    height: u16,
    encoding: i32,
    pixels: &[u8],
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16 + pixels.len());
    buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
    buf.put_u8(0); // padding
    buf.put_u16(1); // number of rectangles
    Rectangle {
        x,
        y,
        width,
        height,
        encoding,
    }
    .write_header(&mut buf);
    buf.put_slice(pixels);
    buf
}

/// Decodes the 4-byte framebuffer-update header from the front of `buf`,
/// returning `(message_type, rectangle_count)` and the bytes consumed.
///
/// Returns `Ok(None)` until 4 bytes are buffered.
///
/// # Errors
///
/// Returns [`RfbError::ProtocolViolation`] if the message type is not
/// [`SERVER_MSG_FRAMEBUFFER_UPDATE`] or the rectangle count is not 1.
pub fn decode_framebuffer_update_header(buf: &[u8]) -> Result<Option<((u8, u16), usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let msg_type = buf[0];
    let rect_count = u16::from_be_bytes([buf[2], buf[3]]);
    if msg_type != SERVER_MSG_FRAMEBUFFER_UPDATE {
        return Err(RfbError::ProtocolViolation(format!(
            "expected FramebufferUpdate (type 0), got {msg_type}"
        )));
    }
    if rect_count != 1 {
        return Err(RfbError::ProtocolViolation(format!(
            "expected 1 rectangle, got {rect_count}"
        )));
    }
    Ok(Some(((msg_type, rect_count), 4)))
}

/// Decodes the 12-byte rectangle header from the front of `buf`.
///
/// Returns `Ok(None)` until 12 bytes are buffered.
///
/// # Errors
///
/// Returns [`RfbError::ProtocolViolation`] if the encoding is anything but
/// [`ENCODING_RAW`].
pub fn decode_rect_header(buf: &[u8]) -> Result<Option<(Rectangle, usize)>> {
    if buf.len() < 12 {
        return Ok(None);
    }
    let rect = Rectangle {
        x: u16::from_be_bytes([buf[0], buf[1]]),
        y: u16::from_be_bytes([buf[2], buf[3]]),
        width: u16::from_be_bytes([buf[4], buf[5]]),
        height: u16::from_be_bytes([buf[6], buf[7]]),
        encoding: i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    };
    if rect.encoding != ENCODING_RAW {
        return Err(RfbError::ProtocolViolation(format!(
            "unsupported encoding {}",
            rect.encoding
        )));
    }
    Ok(Some((rect, 12)))
}

/// A FramebufferUpdateRequest message body.
///
/// The server honours the request by sending a full-surface update; the
/// bounding-box fields are carried on the wire but otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    /// If 1, only changes since the last update are requested. This server
    /// always answers with the full surface either way.
    pub incremental: u8,
    /// X coordinate of the requested region.
    pub x: u16,
    /// Y coordinate of the requested region.
    pub y: u16,
    /// Width of the requested region.
    pub width: u16,
    /// Height of the requested region.
    pub height: u16,
}

/// Encodes the fixed 10-byte FramebufferUpdateRequest message.
#[must_use]
pub fn encode_update_request(req: &UpdateRequest) -> [u8; 10] {
    let mut msg = [0u8; 10];
    msg[0] = CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST;
    msg[1] = req.incremental;
    msg[2..4].copy_from_slice(&req.x.to_be_bytes());
    msg[4..6].copy_from_slice(&req.y.to_be_bytes());
    msg[6..8].copy_from_slice(&req.width.to_be_bytes());
    msg[8..10].copy_from_slice(&req.height.to_be_bytes());
    msg
}

/// Decodes a FramebufferUpdateRequest from the front of `buf`.
///
/// Returns `Ok(None)` until all 10 bytes are buffered.
///
/// # Errors
///
/// Returns [`RfbError::ProtocolViolation`] if the leading byte is not
/// message type 3.
pub fn decode_update_request(buf: &[u8]) -> Result<Option<(UpdateRequest, usize)>> {
    if buf.len() < 10 {
        return Ok(None);
    }
    if buf[0] != CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST {
        return Err(RfbError::ProtocolViolation(format!(
            "expected FramebufferUpdateRequest (type 3), got {}",
            buf[0]
        )));
    }
    let req = UpdateRequest {
        incremental: buf[1],
        x: u16::from_be_bytes([buf[2], buf[3]]),
        y: u16::from_be_bytes([buf[4], buf[5]]),
        width: u16::from_be_bytes([buf[6], buf[7]]),
        height: u16::from_be_bytes([buf[8], buf[9]]),
    };
    Ok(Some((req, 10)))
}
