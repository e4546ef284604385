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

//! The RFB server: a TCP listener that spawns one
//! [`ServerSession`](crate::session::ServerSession) per accepted
//! connection.
//!
//! The listener itself is thin. Sessions are fully independent of each
//! other; the only shared state is the surface provider's read path.

use crate::error::Result;
use crate::events::ServerEvent;
use crate::session::ServerSession;
use crate::surface::SurfaceProvider;
use log::{error, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Desktop name announced in ServerInit.
    pub name: String,
    /// Period of the unconditional full-surface update push.
    pub update_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "rfblite".to_string(),
            update_interval: Duration::from_millis(1000),
        }
    }
}

/// An RFB server bound to a surface provider.
pub struct RfbServer {
    provider: Arc<dyn SurfaceProvider>,
    config: ServerConfig,
    next_id: AtomicUsize,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
}

impl RfbServer {
    /// Creates a server that will serve snapshots of `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn SurfaceProvider>, config: ServerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            provider,
            config,
            next_id: AtomicUsize::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the receiving end of the lifecycle event stream. Returns
    /// `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Binds `0.0.0.0:port` and serves connections until the listener
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or accepting fails; per-session errors
    /// stay inside their session tasks.
    pub async fn listen(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("listening on port {port}");
        self.listen_on(listener).await
    }

    /// Serves connections from an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn listen_on(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, address) = listener.accept().await?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            info!("session {id}: accepted connection from {address}");
            stream.set_nodelay(true)?;

            let session = ServerSession::accept(
                id,
                stream,
                Arc::clone(&self.provider),
                self.config.name.clone(),
                self.config.update_interval,
            );
            let events = self.events_tx.clone();
            let _ = events.send(ServerEvent::ClientConnected { id, address });

            tokio::spawn(async move {
                match session.run().await {
                    Ok(()) => info!("session {id}: closed"),
                    Err(e) => error!("session {id}: ended: {e}"),
                }
                let _ = events.send(ServerEvent::ClientDisconnected { id });
            });
        }
    }
}
