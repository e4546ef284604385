//! In-process mirror: both roles of the protocol in one binary.
//!
//! Starts a server over a static test pattern, connects the client role to
//! it over loopback, and prints a line for every frame the client decodes.
//!
//! Usage:
//!   cargo run --example mirror

use rfblite::{ClientConfig, Frame, RfbClient, RfbServer, ServerConfig, SurfaceProvider};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

const WIDTH: u16 = 320;
const HEIGHT: u16 = 240;

struct TestPattern;

impl SurfaceProvider for TestPattern {
    fn current_size(&self) -> (u16, u16) {
        (WIDTH, HEIGHT)
    }

    fn capture(&self) -> Vec<u8> {
        let mut pixels = vec![0u8; (WIDTH as usize) * (HEIGHT as usize) * 4];
        for y in 0..HEIGHT as usize {
            for x in 0..WIDTH as usize {
                let offset = (y * WIDTH as usize + x) * 4;
                pixels[offset] = (x * 255 / WIDTH as usize) as u8;
                pixels[offset + 1] = (y * 255 / HEIGHT as usize) as u8;
                pixels[offset + 2] = 128;
                pixels[offset + 3] = 255;
            }
        }
        pixels
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let server = RfbServer::new(Arc::new(TestPattern), ServerConfig::default());
    tokio::spawn(async move {
        if let Err(e) = server.listen(5901).await {
            eprintln!("server error: {e}");
        }
    });

    // Give the listener a moment to bind before dialing it.
    time::sleep(Duration::from_millis(100)).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let client = RfbClient::connect(ClientConfig::new("127.0.0.1", 5901), Arc::new(tx)).await?;

    for n in 1..=5 {
        match rx.recv().await {
            Some(frame) => println!(
                "frame {n}: {}x{} ({} bytes)",
                frame.width,
                frame.height,
                frame.pixels.len()
            ),
            None => break,
        }
    }

    client.disconnect().await;
    println!("disconnected");
    Ok(())
}
