//! Headless RFB server example with animated content.
//!
//! Serves an animated gradient without any real screen behind it, showing
//! how to implement `SurfaceProvider` for a synthetic surface.
//!
//! Usage:
//!   cargo run --example headless_server
//!
//! Then connect with a VNC viewer to localhost:5900

use rfblite::{RfbServer, ServerConfig, SurfaceProvider};
use std::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const WIDTH: u16 = 640;
const HEIGHT: u16 = 480;

/// A synthetic surface: every capture advances the animation one frame.
struct AnimatedSurface {
    frame: AtomicU32,
}

impl SurfaceProvider for AnimatedSurface {
    fn current_size(&self) -> (u16, u16) {
        (WIDTH, HEIGHT)
    }

    fn capture(&self) -> Vec<u8> {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed);
        let mut pixels = vec![0u8; (WIDTH as usize) * (HEIGHT as usize) * 4];
        for y in 0..HEIGHT as u32 {
            for x in 0..WIDTH as u32 {
                let offset = ((y * WIDTH as u32 + x) * 4) as usize;
                pixels[offset] = ((x + frame) % 256) as u8;
                pixels[offset + 1] = ((y + frame) % 256) as u8;
                pixels[offset + 2] = ((frame / 2) % 256) as u8;
                pixels[offset + 3] = 255; // Alpha
            }
        }
        pixels
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting headless RFB server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");
    println!("Press Ctrl+C to stop");

    let provider = Arc::new(AnimatedSurface {
        frame: AtomicU32::new(0),
    });
    let server = RfbServer::new(
        provider,
        ServerConfig {
            name: "rfblite headless".to_string(),
            ..ServerConfig::default()
        },
    );

    server.listen(5900).await?;
    Ok(())
}
