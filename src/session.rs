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

//! Per-connection server session.
//!
//! One session per accepted connection, each on its own task. A session
//! owns its stream and inbound buffer outright; the only thing it shares
//! is the read path of the surface provider. It sends the version banner
//! immediately, drives the handshake as bytes arrive, and once established
//! pushes a full-surface raw update on every cadence tick and on every
//! explicit update request.
//!
//! The session is generic over the stream so it can run on anything
//! byte-stream shaped (a `TcpStream` in production, `tokio::io::duplex`
//! in tests).

use crate::error::{Result, RfbError};
use crate::handshake::{Handshake, HandshakeState};
use crate::protocol::{
    decode_update_request, encode_framebuffer_update, PixelFormat, ServerInit,
    CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, ENCODING_RAW,
};
use crate::surface::{composite_overlay, SurfaceProvider};
use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// A server-side RFB session bound to one connection.
pub struct ServerSession<S> {
    id: usize,
    stream: S,
    provider: Arc<dyn SurfaceProvider>,
    handshake: Handshake,
    buffer: BytesMut,
    update_interval: Duration,
}

impl<S> ServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Constructs a session over an accepted connection. The handshake
    /// begins on the first iteration of [`run`](Self::run); this role is
    /// the banner-sender.
    pub fn accept(
        id: usize,
        stream: S,
        provider: Arc<dyn SurfaceProvider>,
        name: String,
        update_interval: Duration,
    ) -> Self {
        let (width, height) = provider.current_size();
        let init = ServerInit {
            width,
            height,
            pixel_format: PixelFormat::rfb(),
            name,
        };
        Self {
            id,
            stream,
            provider,
            handshake: Handshake::server(init),
            buffer: BytesMut::with_capacity(4096),
            update_interval,
        }
    }

    /// Runs the session to completion: handshake, then the message loop
    /// with its unconditional update cadence.
    ///
    /// Returns when the peer disconnects or a protocol error ends the
    /// session. The caller (the listener) logs the outcome; errors never
    /// cross session boundaries.
    ///
    /// # Errors
    ///
    /// [`RfbError::Disconnected`] when the peer closes;
    /// [`RfbError::ProtocolViolation`] on malformed handshake input;
    /// [`RfbError::Io`] on transport failure.
    pub async fn run(mut self) -> Result<()> {
        // Queue and flush the banner before any bytes arrive.
        self.drive_handshake().await?;

        let mut cadence: Option<Interval> = None;
        loop {
            tokio::select! {
                _ = tick(&mut cadence), if cadence.is_some() => {
                    if let Err(e) = self.send_update().await {
                        warn!("session {}: periodic update failed: {e}", self.id);
                    }
                }
                read = self.stream.read_buf(&mut self.buffer) => {
                    if read? == 0 {
                        return Err(RfbError::Disconnected);
                    }
                    self.on_bytes(&mut cadence).await?;
                }
            }
        }
    }

    /// Handles freshly appended inbound bytes: advances the handshake if it
    /// is still in progress, then dispatches any complete client messages.
    async fn on_bytes(&mut self, cadence: &mut Option<Interval>) -> Result<()> {
        if !self.handshake.is_established() {
            let state = self.drive_handshake().await?;
            if state == HandshakeState::Established {
                debug!("session {}: handshake complete", self.id);
                // First update goes out unconditionally; the cadence then
                // repeats it for the life of the connection.
                if let Err(e) = self.send_update().await {
                    warn!("session {}: initial update failed: {e}", self.id);
                }
                let mut interval =
                    time::interval_at(Instant::now() + self.update_interval, self.update_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *cadence = Some(interval);
            } else {
                return Ok(());
            }
        }
        self.dispatch_messages().await
    }

    /// Advances the handshake against the current buffer and flushes
    /// whatever it queued for the peer.
    async fn drive_handshake(&mut self) -> Result<HandshakeState> {
        let mut outbound = BytesMut::new();
        let state = self.handshake.advance(&mut self.buffer, &mut outbound)?;
        if !outbound.is_empty() {
            self.stream.write_all(&outbound).await?;
        }
        Ok(state)
    }

    /// Consumes complete client messages from the front of the buffer.
    ///
    /// An update request (type 3, 10 bytes) triggers an immediate send; a
    /// partial one stays buffered. Anything else is skipped one byte at a
    /// time, matching the lenient dispatch this protocol subset allows.
    async fn dispatch_messages(&mut self) -> Result<()> {
        while !self.buffer.is_empty() {
            let msg_type = self.buffer[0];
            if msg_type == CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST {
                let Some((req, consumed)) = decode_update_request(&self.buffer)? else {
                    break;
                };
                self.buffer.advance(consumed);
                trace!(
                    "session {}: update request (incremental={})",
                    self.id,
                    req.incremental
                );
                if let Err(e) = self.send_update().await {
                    warn!("session {}: requested update failed: {e}", self.id);
                }
            } else {
                trace!("session {}: skipping message type {msg_type}", self.id);
                self.buffer.advance(1);
            }
        }
        Ok(())
    }

    /// Captures the surface, composites the overlay if one exists, and
    /// writes a single full-surface raw rectangle.
    async fn send_update(&mut self) -> Result<()> {
        let (width, height) = self.provider.current_size();
        let mut pixels = self.provider.capture();
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            warn!(
                "session {}: provider returned {} bytes for {width}x{height}, skipping update",
                self.id,
                pixels.len()
            );
            return Ok(());
        }

        if let Some(overlay) = self.provider.overlay() {
            composite_overlay(&mut pixels, width, height, &overlay);
        }

        let update = encode_framebuffer_update(0, 0, width, height, ENCODING_RAW, &pixels);
        self.stream.write_all(&update).await?;
        debug!(
            "session {}: sent {width}x{height} update ({} bytes)",
            self.id,
            update.len()
        );
        Ok(())
    }
}

/// Awaits the next cadence tick. Only polled while the interval exists.
async fn tick(cadence: &mut Option<Interval>) {
    match cadence {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_update_request, UpdateRequest};
    use tokio::io::DuplexStream;

    struct TestProvider {
        width: u16,
        height: u16,
    }

    impl SurfaceProvider for TestProvider {
        fn current_size(&self) -> (u16, u16) {
            (self.width, self.height)
        }

        fn capture(&self) -> Vec<u8> {
            (0..self.width as usize * self.height as usize * 4)
                .map(|i| i as u8)
                .collect()
        }
    }

    /// A session over one end of a duplex pipe, cadence far enough out that
    /// only explicit triggers produce updates.
    fn session_under_test(w: u16, h: u16) -> (ServerSession<DuplexStream>, DuplexStream) {
        let (server_end, client_end) = tokio::io::duplex(1 << 20);
        let provider = Arc::new(TestProvider { width: w, height: h });
        let session = ServerSession::accept(
            0,
            server_end,
            provider,
            "Test".to_string(),
            Duration::from_secs(3600),
        );
        (session, client_end)
    }

    /// Walks the scripted client half of the handshake over the pipe and
    /// returns once ServerInit has been read.
    async fn complete_handshake(client: &mut DuplexStream) {
        let mut banner = [0u8; 12];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"RFB 003.008\n");
        client.write_all(b"RFB 003.008\n").await.unwrap();

        let mut security = [0u8; 2];
        client.read_exact(&mut security).await.unwrap();
        assert_eq!(security, [1, 1]);
        client.write_all(&[1]).await.unwrap();

        let mut result = [0u8; 4];
        client.read_exact(&mut result).await.unwrap();
        assert_eq!(result, [0, 0, 0, 0]);
        client.write_all(&[1]).await.unwrap();

        let mut init = [0u8; 24];
        client.read_exact(&mut init).await.unwrap();
        let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]);
        let mut name = vec![0u8; name_len as usize];
        client.read_exact(&mut name).await.unwrap();
        assert_eq!(name, b"Test");
    }

    /// Reads one full framebuffer update and returns its rectangle fields
    /// and payload length.
    async fn read_update(client: &mut DuplexStream) -> (u16, u16, u16, u16, i32, usize) {
        let mut header = [0u8; 4];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 1);

        let mut rect = [0u8; 12];
        client.read_exact(&mut rect).await.unwrap();
        let x = u16::from_be_bytes([rect[0], rect[1]]);
        let y = u16::from_be_bytes([rect[2], rect[3]]);
        let w = u16::from_be_bytes([rect[4], rect[5]]);
        let h = u16::from_be_bytes([rect[6], rect[7]]);
        let encoding = i32::from_be_bytes([rect[8], rect[9], rect[10], rect[11]]);

        let mut payload = vec![0u8; w as usize * h as usize * 4];
        client.read_exact(&mut payload).await.unwrap();
        (x, y, w, h, encoding, payload.len())
    }

    #[tokio::test]
    async fn handshake_then_initial_update() {
        let (session, mut client) = session_under_test(100, 50);
        let task = tokio::spawn(session.run());

        complete_handshake(&mut client).await;
        let (x, y, w, h, encoding, payload) = read_update(&mut client).await;
        assert_eq!((x, y, w, h), (0, 0, 100, 50));
        assert_eq!(encoding, 0);
        assert_eq!(payload, 20_000);

        drop(client);
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Err(RfbError::Disconnected)));
    }

    #[tokio::test]
    async fn update_request_triggers_send() {
        let (session, mut client) = session_under_test(8, 4);
        let task = tokio::spawn(session.run());

        complete_handshake(&mut client).await;
        read_update(&mut client).await; // initial push

        let req = encode_update_request(&UpdateRequest {
            incremental: 1,
            x: 0,
            y: 0,
            width: 8,
            height: 4,
        });
        client.write_all(&req).await.unwrap();

        let (_, _, w, h, _, payload) = read_update(&mut client).await;
        assert_eq!((w, h), (8, 4));
        assert_eq!(payload, 8 * 4 * 4);

        drop(client);
        task.await.unwrap().unwrap_err();
    }

    #[tokio::test]
    async fn unknown_message_types_are_skipped() {
        let (session, mut client) = session_under_test(2, 2);
        let task = tokio::spawn(session.run());

        complete_handshake(&mut client).await;
        read_update(&mut client).await;

        // A key event (type 4) the server does not transport, then a
        // valid update request; the session must survive the former and
        // answer the latter.
        client
            .write_all(&[4, 1, 0, 0, 0, 0, 0, 0x41])
            .await
            .unwrap();
        let req = encode_update_request(&UpdateRequest {
            incremental: 1,
            x: 0,
            y: 0,
            width: 2,
            height: 2,
        });
        client.write_all(&req).await.unwrap();

        let (_, _, w, h, _, _) = read_update(&mut client).await;
        assert_eq!((w, h), (2, 2));

        drop(client);
        task.await.unwrap().unwrap_err();
    }
}
