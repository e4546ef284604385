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

//! The boundary to the rendering and display subsystems.
//!
//! The engine never renders or displays anything itself. A server session
//! pulls pixel snapshots from a [`SurfaceProvider`]; a client session pushes
//! decoded frames into a [`FrameSink`]. Both traits are object-safe so the
//! hosting application can hand in whatever it has.

use log::warn;
use tokio::sync::mpsc;

/// A source of pixels for a server session.
///
/// Implementations must tolerate concurrent calls: every connected session
/// pulls snapshots on its own cadence and nothing serializes them.
pub trait SurfaceProvider: Send + Sync {
    /// Current surface dimensions in pixels.
    fn current_size(&self) -> (u16, u16);

    /// A snapshot of the surface: RGBA8, row-major, top-to-bottom,
    /// `width * height * 4` bytes for the dimensions reported by
    /// [`current_size`](Self::current_size) at the same moment.
    fn capture(&self) -> Vec<u8>;

    /// An auxiliary layer to composite over the base snapshot, if one
    /// exists (e.g. an accelerated viewport rendered separately from the
    /// rest of the surface). Default: none.
    fn overlay(&self) -> Option<Overlay> {
        None
    }
}

/// A secondary rendered layer merged into the outgoing frame at a fixed
/// offset.
#[derive(Debug, Clone)]
pub struct Overlay {
    /// X offset of the overlay's top-left corner on the base surface.
    pub x: u16,
    /// Y offset of the overlay's top-left corner on the base surface.
    pub y: u16,
    /// Overlay width in pixels.
    pub width: u16,
    /// Overlay height in pixels.
    pub height: u16,
    /// RGBA8 overlay pixels, row-major, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
}

/// One complete decoded framebuffer image.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Image width in pixels.
    pub width: u16,
    /// Image height in pixels.
    pub height: u16,
    /// RGBA8 pixels, row-major, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
}

/// Receives decoded frames from a client session.
///
/// Called from the session's background task, never from the context that
/// created the session. Each call carries an owned copy of the full image,
/// delivered exactly once per completed frame; partial frames are never
/// delivered.
pub trait FrameSink: Send + Sync {
    /// Hands over one complete frame.
    fn deliver(&self, frame: Frame);

    /// Reports the single human-readable message for a session-fatal
    /// error. Default implementation logs it.
    fn session_error(&self, message: String) {
        warn!("client session error: {message}");
    }
}

/// Queued, ordered delivery onto whatever context owns the receiver. Frames
/// for which no receiver exists anymore are dropped silently.
impl FrameSink for mpsc::UnboundedSender<Frame> {
    fn deliver(&self, frame: Frame) {
        let _ = self.send(frame);
    }
}

/// Source-over composites `overlay` onto `base` at the overlay's declared
/// offset, clipping whatever falls outside the base surface.
pub fn composite_overlay(base: &mut [u8], base_width: u16, base_height: u16, overlay: &Overlay) {
    let bw = base_width as usize;
    let bh = base_height as usize;
    let ow = overlay.width as usize;
    let oh = overlay.height as usize;

    for row in 0..oh {
        let dst_y = overlay.y as usize + row;
        if dst_y >= bh {
            break;
        }
        for col in 0..ow {
            let dst_x = overlay.x as usize + col;
            if dst_x >= bw {
                break;
            }
            let src = (row * ow + col) * 4;
            let dst = (dst_y * bw + dst_x) * 4;
            if src + 4 > overlay.pixels.len() || dst + 4 > base.len() {
                return;
            }

            let alpha = u32::from(overlay.pixels[src + 3]);
            let inv = 255 - alpha;
            for c in 0..3 {
                let blended = (u32::from(overlay.pixels[src + c]) * alpha
                    + u32::from(base[dst + c]) * inv)
                    / 255;
                base[dst + c] = blended as u8;
            }
            let out_alpha = alpha + u32::from(base[dst + 3]) * inv / 255;
            base[dst + 3] = out_alpha.min(255) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u16, h: u16, rgba: [u8; 4]) -> Vec<u8> {
        rgba.iter()
            .copied()
            .cycle()
            .take(w as usize * h as usize * 4)
            .collect()
    }

    #[test]
    fn opaque_overlay_replaces_region() {
        let mut base = solid(4, 4, [10, 10, 10, 255]);
        let overlay = Overlay {
            x: 1,
            y: 1,
            width: 2,
            height: 2,
            pixels: solid(2, 2, [200, 0, 0, 255]),
        };
        composite_overlay(&mut base, 4, 4, &overlay);

        // Covered pixel at (1, 1).
        let idx = (4 + 1) * 4;
        assert_eq!(&base[idx..idx + 4], &[200, 0, 0, 255]);
        // Untouched pixel.
        assert_eq!(&base[0..4], &[10, 10, 10, 255]);
    }

    #[test]
    fn transparent_overlay_leaves_base() {
        let mut base = solid(2, 2, [10, 20, 30, 255]);
        let overlay = Overlay {
            x: 0,
            y: 0,
            width: 2,
            height: 2,
            pixels: solid(2, 2, [200, 200, 200, 0]),
        };
        composite_overlay(&mut base, 2, 2, &overlay);
        assert_eq!(base, solid(2, 2, [10, 20, 30, 255]));
    }

    #[test]
    fn half_transparent_overlay_blends() {
        let mut base = solid(1, 1, [0, 0, 0, 255]);
        let overlay = Overlay {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            pixels: vec![255, 255, 255, 128],
        };
        composite_overlay(&mut base, 1, 1, &overlay);
        // (255*128 + 0*127) / 255 = 128
        assert_eq!(&base[..3], &[128, 128, 128]);
        assert_eq!(base[3], 255);
    }

    #[test]
    fn overlay_clips_at_surface_edge() {
        let mut base = solid(3, 3, [0, 0, 0, 255]);
        let overlay = Overlay {
            x: 2,
            y: 2,
            width: 4,
            height: 4,
            pixels: solid(4, 4, [255, 0, 0, 255]),
        };
        composite_overlay(&mut base, 3, 3, &overlay);

        let idx = (2 * 3 + 2) * 4;
        assert_eq!(&base[idx..idx + 4], &[255, 0, 0, 255]);
        // Nothing wrote out of bounds and in-bounds neighbours are intact.
        assert_eq!(&base[0..4], &[0, 0, 0, 255]);
    }
}
