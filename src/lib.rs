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


//! # rfblite
//!
//! A minimal RFB (Remote Framebuffer, the protocol VNC speaks) engine
//! implementing both halves of a deliberately narrow protocol subset:
//! version 3.8, security type None, true-colour 32-bit pixels, and raw
//! full-surface updates.
//!
//! ## Roles
//!
//! - **Server**: [`RfbServer`] accepts viewers and runs one
//!   [`ServerSession`] per connection. Each session pulls snapshots from a
//!   [`SurfaceProvider`] you supply and pushes a complete raw frame on a
//!   fixed cadence as well as on every explicit update request.
//! - **Client**: [`RfbClient`] connects out, performs the handshake, and
//!   decodes incoming updates into a persistent image, handing an owned
//!   copy of each completed frame to the [`FrameSink`] you supply.
//!
//! Rendering and display live outside this crate; the two traits above are
//! the whole boundary.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rfblite::{RfbServer, ServerConfig, SurfaceProvider};
//! use std::sync::Arc;
//!
//! struct Gray;
//!
//! impl SurfaceProvider for Gray {
//!     fn current_size(&self) -> (u16, u16) {
//!         (640, 480)
//!     }
//!     fn capture(&self) -> Vec<u8> {
//!         vec![0x80; 640 * 480 * 4]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RfbServer::new(Arc::new(Gray), ServerConfig::default());
//!     server.listen(5900).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! server role                         client role
//!
//! SurfaceProvider (pull)              FrameSink (push)
//!        ▲                                  ▲
//!        │                                  │
//!  ServerSession ── handshake/codec ── RfbClient task
//!        ▲            (shared)
//!        │
//!    RfbServer (listener, 1 session per connection)
//! ```
//!
//! Sessions never share mutable state; each owns its connection and its
//! inbound buffer, and the handshake is a pure state machine over those
//! buffers, identical on both roles with reads and writes swapped.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod events;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;
pub mod surface;

// Re-exports
pub use client::{ClientConfig, Credentials, RfbClient};
pub use error::{Result, RfbError};
pub use events::ServerEvent;
pub use handshake::{Handshake, HandshakeState, Role};
pub use protocol::{PixelFormat, Rectangle, ServerInit, UpdateRequest};
pub use server::{RfbServer, ServerConfig};
pub use session::ServerSession;
pub use surface::{Frame, FrameSink, Overlay, SurfaceProvider};

/// RFB protocol version.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Default RFB port.
pub const DEFAULT_PORT: u16 = 5900;
