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

//! The client (viewer) session.
//!
//! [`RfbClient::connect`] establishes the TCP connection under the connect
//! timeout, then moves the rest of the session onto a background task: the
//! handshake as the read-first party, one initial update request, and the
//! read loop that decodes framebuffer updates into a persistent image.
//! Every completed frame is handed to the [`FrameSink`] as an owned copy;
//! a frame that cannot be completed is discarded, never delivered.
//!
//! The read loop waits in short slices so [`RfbClient::disconnect`] can
//! stop it cooperatively from any task, including the sink's own context.

use crate::error::{Result, RfbError};
use crate::handshake::Handshake;
use crate::protocol::{
    decode_framebuffer_update_header, decode_rect_header, encode_update_request, Rectangle,
    ServerInit, UpdateRequest, SERVER_MSG_FRAMEBUFFER_UPDATE,
};
use crate::surface::{Frame, FrameSink};
use bytes::{Buf, BytesMut};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Login credentials.
///
/// Carried for API compatibility with deployments that front the server
/// with an authenticating proxy; the protocol subset itself only speaks
/// security type None, so nothing here reaches the wire.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

/// Connection parameters for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Optional credentials, see [`Credentials`].
    pub credentials: Option<Credentials>,
    /// Bound on establishing the TCP connection; the handshake must also
    /// complete within this bound once connected.
    pub connect_timeout: Duration,
    /// Length of one read slice in the message loop. Between slices the
    /// session checks for a pending disconnect, so this also bounds how
    /// long `disconnect` waits.
    pub read_timeout: Duration,
    /// Bound on receiving the complete body of one framebuffer update.
    pub pixel_timeout: Duration,
}

impl ClientConfig {
    /// Configuration for `host:port` with default timeouts: 5 s connect,
    /// 100 ms read slices, 1 s per update body.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(100),
            pixel_timeout: Duration::from_secs(1),
        }
    }
}

/// Handle to a running client session.
///
/// Dropping the handle does not stop the session; call
/// [`disconnect`](Self::disconnect).
pub struct RfbClient {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RfbClient {
    /// Connects to the server and starts the session.
    ///
    /// The TCP connection is established before this returns; handshake
    /// and message loop run on a background task. Handshake failures are
    /// reported through `sink.session_error`, not here.
    ///
    /// # Errors
    ///
    /// [`RfbError::ConnectTimeout`] if the connection is not established
    /// within `config.connect_timeout`; [`RfbError::Io`] if it is refused.
    pub async fn connect(config: ClientConfig, sink: Arc<dyn FrameSink>) -> Result<Self> {
        let stream = time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| RfbError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        info!("connected to {}:{}", config.host, config.port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(session_main(stream, config, sink, shutdown_rx));
        Ok(Self {
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stops the session and waits for the background task to exit.
    ///
    /// Idempotent: safe to call repeatedly and from multiple tasks at
    /// once, including from the sink's context while the read loop is
    /// live. Only the first caller joins the task; later calls return
    /// once it is gone.
    pub async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            let _ = handle.await;
        }
    }
}

/// Runs the session and routes its outcome: clean exits and
/// disconnect-triggered teardown are logged, everything else becomes one
/// `session_error` message.
async fn session_main(
    stream: TcpStream,
    config: ClientConfig,
    sink: Arc<dyn FrameSink>,
    shutdown: watch::Receiver<bool>,
) {
    let mut session = ClientSession {
        stream,
        buffer: BytesMut::with_capacity(8192),
        image: None,
        sink,
        shutdown,
        connect_timeout: config.connect_timeout,
        read_timeout: config.read_timeout,
        pixel_timeout: config.pixel_timeout,
    };
    match session.run().await {
        Ok(()) => info!("client session ended"),
        Err(e) if *session.shutdown.borrow() => {
            debug!("client session ended during disconnect: {e}");
        }
        Err(e) => {
            error!("client session failed: {e}");
            session.sink.session_error(e.to_string());
        }
    }
}

struct ClientSession<S> {
    stream: S,
    buffer: BytesMut,
    /// The persistent decoded image; sized from ServerInit, updated by
    /// every decoded rectangle, copied out on delivery.
    image: Option<Frame>,
    sink: Arc<dyn FrameSink>,
    shutdown: watch::Receiver<bool>,
    connect_timeout: Duration,
    read_timeout: Duration,
    pixel_timeout: Duration,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(&mut self) -> Result<()> {
        let init = match self.perform_handshake().await? {
            Some(init) => init,
            None => return Ok(()), // disconnect during handshake
        };

        let width = init.width;
        let height = init.height;
        self.image = Some(Frame {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        });

        // One request up front; after that the server's own cadence keeps
        // frames coming.
        let request = encode_update_request(&UpdateRequest {
            incremental: 1,
            x: 0,
            y: 0,
            width,
            height,
        });
        self.stream.write_all(&request).await?;
        debug!("sent initial update request for {width}x{height}");

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            if self.buffer.is_empty() && !self.fill(None).await? {
                return Ok(());
            }
            match self.buffer[0] {
                SERVER_MSG_FRAMEBUFFER_UPDATE => {
                    if !self.handle_update().await? {
                        return Ok(());
                    }
                }
                other => return Err(RfbError::UnsupportedMessage(other)),
            }
        }
    }

    /// Drives the handshake to `Established` under the connect-timeout
    /// deadline. Returns the server's init block, or `None` if disconnect
    /// was requested first.
    async fn perform_handshake(&mut self) -> Result<Option<ServerInit>> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut handshake = Handshake::client();
        let mut outbound = BytesMut::new();
        loop {
            handshake.advance(&mut self.buffer, &mut outbound)?;
            if !outbound.is_empty() {
                self.stream.write_all(&outbound).await?;
                outbound.clear();
            }
            if handshake.is_established() {
                break;
            }
            if !self.fill(Some(deadline)).await? {
                return Ok(None);
            }
        }
        let Some(init) = handshake.peer_init().cloned() else {
            return Err(RfbError::ProtocolViolation(
                "handshake established without ServerInit".to_string(),
            ));
        };
        Ok(Some(init))
    }

    /// Decodes one framebuffer update and delivers the refreshed image.
    ///
    /// Returns `Ok(false)` if disconnect was requested mid-message; the
    /// partial frame is dropped on the floor in that case, and on every
    /// error path.
    async fn handle_update(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.pixel_timeout;

        let header_len = loop {
            if let Some((_, consumed)) = decode_framebuffer_update_header(&self.buffer)? {
                break consumed;
            }
            if !self.fill(Some(deadline)).await? {
                return Ok(false);
            }
        };
        self.buffer.advance(header_len);

        let rect = loop {
            if let Some((rect, consumed)) = decode_rect_header(&self.buffer)? {
                self.buffer.advance(consumed);
                break rect;
            }
            if !self.fill(Some(deadline)).await? {
                return Ok(false);
            }
        };

        let needed = rect.width as usize * rect.height as usize * 4;
        while self.buffer.len() < needed {
            if !self.fill(Some(deadline)).await? {
                return Ok(false);
            }
        }
        let pixels = self.buffer.split_to(needed);

        let Some(image) = self.image.as_mut() else {
            return Err(RfbError::ProtocolViolation(
                "update before ServerInit".to_string(),
            ));
        };
        blit(image, &rect, &pixels);
        debug!(
            "decoded {}x{} rectangle at ({}, {})",
            rect.width, rect.height, rect.x, rect.y
        );
        self.sink.deliver(image.clone());
        Ok(true)
    }

    /// Reads more bytes into the buffer, waiting in `read_timeout` slices
    /// so a pending disconnect is noticed promptly.
    ///
    /// Returns `Ok(true)` once at least one byte arrived and `Ok(false)`
    /// if disconnect was requested while waiting.
    ///
    /// # Errors
    ///
    /// [`RfbError::Timeout`] once `deadline` passes without the read
    /// completing; [`RfbError::Disconnected`] on EOF. Without a deadline
    /// the wait only ends with bytes, disconnect, or connection loss.
    async fn fill(&mut self, deadline: Option<Instant>) -> Result<bool> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(false);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(RfbError::Timeout);
                    }
                    remaining.min(self.read_timeout)
                }
                None => self.read_timeout,
            };
            match time::timeout(slice, self.stream.read_buf(&mut self.buffer)).await {
                Err(_) => continue, // slice elapsed, re-check shutdown/deadline
                Ok(Ok(0)) => return Err(RfbError::Disconnected),
                Ok(Ok(_)) => return Ok(true),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Copies a decoded rectangle into the persistent image at its offset,
/// clipping anything that falls outside the image.
fn blit(image: &mut Frame, rect: &Rectangle, pixels: &[u8]) {
    let iw = image.width as usize;
    let ih = image.height as usize;
    let rw = rect.width as usize;
    let rx = rect.x as usize;
    let ry = rect.y as usize;

    let copy_width = rw.min(iw.saturating_sub(rx));
    if copy_width == 0 {
        return;
    }
    for row in 0..rect.height as usize {
        let dst_y = ry + row;
        if dst_y >= ih {
            break;
        }
        let src = row * rw * 4;
        let dst = (dst_y * iw + rx) * 4;
        image.pixels[dst..dst + copy_width * 4].copy_from_slice(&pixels[src..src + copy_width * 4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_framebuffer_update, encode_server_init, PixelFormat, ENCODING_RAW};
    use crate::server::{RfbServer, ServerConfig};
    use crate::surface::SurfaceProvider;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, Notify};

    struct TestProvider;

    impl SurfaceProvider for TestProvider {
        fn current_size(&self) -> (u16, u16) {
            (16, 8)
        }

        fn capture(&self) -> Vec<u8> {
            (0..16usize * 8 * 4).map(|i| i as u8).collect()
        }
    }

    #[derive(Default)]
    struct CollectSink {
        frames: StdMutex<Vec<Frame>>,
        errors: StdMutex<Vec<String>>,
        notify: Notify,
    }

    impl FrameSink for CollectSink {
        fn deliver(&self, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn session_error(&self, message: String) {
            self.errors.lock().unwrap().push(message);
            self.notify.notify_one();
        }
    }

    async fn spawn_mirror_server(update_interval: Duration) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RfbServer::new(
            Arc::new(TestProvider),
            ServerConfig {
                name: "Mirror".to_string(),
                update_interval,
            },
        );
        tokio::spawn(async move {
            let _ = server.listen_on(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn mirror_session_delivers_frames() {
        let addr = spawn_mirror_server(Duration::from_millis(50)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = RfbClient::connect(
            ClientConfig::new(addr.ip().to_string(), addr.port()),
            Arc::new(tx),
        )
        .await
        .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.pixels, TestProvider.capture());

        // The server's cadence keeps pushing without further requests.
        let second = rx.recv().await.unwrap();
        assert_eq!(second.pixels.len(), 16 * 8 * 4);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_concurrent_safe() {
        let addr = spawn_mirror_server(Duration::from_millis(1000)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(
            RfbClient::connect(
                ClientConfig::new(addr.ip().to_string(), addr.port()),
                Arc::new(tx),
            )
            .await
            .unwrap(),
        );
        // Session is live; first frame proves the loop is running.
        rx.recv().await.unwrap();

        let (a, b) = (Arc::clone(&client), Arc::clone(&client));
        let first = tokio::spawn(async move { a.disconnect().await });
        let second = tokio::spawn(async move { b.disconnect().await });
        first.await.unwrap();
        second.await.unwrap();

        // And again, sequentially, after the task is long gone.
        client.disconnect().await;
    }

    /// A scripted server that completes the handshake, then sends a
    /// truncated pixel payload and either stalls or closes.
    async fn scripted_truncating_server(close_after: bool) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"RFB 003.008\n").await.unwrap();
            let mut banner = [0u8; 12];
            stream.read_exact(&mut banner).await.unwrap();
            stream.write_all(&[1, 1]).await.unwrap();
            let mut choice = [0u8; 1];
            stream.read_exact(&mut choice).await.unwrap();
            stream.write_all(&[0, 0, 0, 0]).await.unwrap();
            let mut shared = [0u8; 1];
            stream.read_exact(&mut shared).await.unwrap();
            let init = encode_server_init(4, 4, &PixelFormat::rfb(), "Trunc");
            stream.write_all(&init).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();

            // Header and rectangle promise 64 pixel bytes; send 20.
            let update = encode_framebuffer_update(0, 0, 4, 4, ENCODING_RAW, &[7u8; 64]);
            stream.write_all(&update[..16 + 20]).await.unwrap();

            if close_after {
                drop(stream);
            } else {
                time::sleep(Duration::from_secs(5)).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn truncated_payload_then_close_delivers_nothing() {
        let addr = scripted_truncating_server(true).await;

        let sink = Arc::new(CollectSink::default());
        let client = RfbClient::connect(
            ClientConfig::new(addr.ip().to_string(), addr.port()),
            Arc::clone(&sink) as Arc<dyn FrameSink>,
        )
        .await
        .unwrap();

        sink.notify.notified().await;
        assert!(sink.frames.lock().unwrap().is_empty());
        let errors = sink.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn stalled_payload_times_out_without_delivery() {
        let addr = scripted_truncating_server(false).await;

        let sink = Arc::new(CollectSink::default());
        let mut config = ClientConfig::new(addr.ip().to_string(), addr.port());
        config.read_timeout = Duration::from_millis(20);
        config.pixel_timeout = Duration::from_millis(150);
        let client = RfbClient::connect(config, Arc::clone(&sink) as Arc<dyn FrameSink>)
            .await
            .unwrap();

        sink.notify.notified().await;
        assert!(sink.frames.lock().unwrap().is_empty());
        let errors = sink.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Timed out"), "got: {}", errors[0]);

        client.disconnect().await;
    }

    #[test]
    fn blit_clips_to_image_bounds() {
        let mut image = Frame {
            width: 4,
            height: 4,
            pixels: vec![0; 4 * 4 * 4],
        };
        let rect = Rectangle {
            x: 3,
            y: 3,
            width: 2,
            height: 2,
            encoding: ENCODING_RAW,
        };
        let pixels = vec![9u8; 2 * 2 * 4];
        blit(&mut image, &rect, &pixels);

        let idx = (3 * 4 + 3) * 4;
        assert_eq!(&image.pixels[idx..idx + 4], &[9, 9, 9, 9]);
        assert_eq!(image.pixels[0], 0);
    }
}
