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

//! The RFB handshake as an explicit state machine.
//!
//! Both roles walk the same strictly ordered phases with reads and writes
//! swapped. The machine is pure over byte buffers: whenever new bytes are
//! appended to the inbound buffer, call [`Handshake::advance`]; it consumes
//! exactly the bytes the current phase declares, queues any bytes the role
//! must send, and stops when the buffer runs dry. How the bytes arrive
//! (poller, callback, blocking read) is the session's business, which keeps
//! the phase logic chunking-invariant and independently testable.
//!
//! State is monotonic. A phase either completes or waits; there are no
//! backward transitions and every phase runs at most once per session.

use crate::error::{Result, RfbError};
use crate::protocol::{
    decode_security_types, decode_server_init, encode_protocol_banner, ServerInit,
    SECURITY_RESULT_OK, SECURITY_TYPE_NONE,
};
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, trace};

/// The ordered phases of an RFB session establishment.
///
/// The variant order is the wire order; the derived `Ord` reflects it, so
/// progress can be compared (`state >= HandshakeState::ClientInit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// Both sides exchange the fixed 12-byte version banner. The server
    /// writes first, immediately on accept.
    ProtocolVersionExchange,
    /// The server offers its security-type list; the client answers with
    /// its choice.
    SecurityNegotiation,
    /// The server reports a 4-byte security result.
    SecurityResult,
    /// The client sends its 1-byte shared-session flag.
    ClientInit,
    /// The server describes its framebuffer: dimensions, pixel format, name.
    ServerInit,
    /// Handshake complete; application messages flow from here on.
    Established,
}

/// Which half of the protocol this machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Banner-sender; owns the surface.
    Server,
    /// Banner-reader; decodes updates.
    Client,
}

/// Drives one role through the handshake phases.
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    banner_sent: bool,
    /// Server role: the init block to announce. Client role: the block the
    /// server announced, available once `Established`.
    server_init: Option<ServerInit>,
}

impl Handshake {
    /// Creates the server half. `init` is announced during the
    /// [`HandshakeState::ServerInit`] phase.
    #[must_use]
    pub fn server(init: ServerInit) -> Self {
        Self {
            role: Role::Server,
            state: HandshakeState::ProtocolVersionExchange,
            banner_sent: false,
            server_init: Some(init),
        }
    }

    /// Creates the client half.
    #[must_use]
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            state: HandshakeState::ProtocolVersionExchange,
            banner_sent: false,
            server_init: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// The ServerInit the peer announced. Client role only, `Some` once the
    /// handshake is established.
    #[must_use]
    pub fn peer_init(&self) -> Option<&ServerInit> {
        match self.role {
            Role::Client => self.server_init.as_ref(),
            Role::Server => None,
        }
    }

    /// Advances the machine as far as the buffered bytes allow.
    ///
    /// Consumes completed units from the front of `inbound` and appends
    /// everything this role owes the peer to `outbound` (the caller flushes
    /// it to the connection). Safe to call again after more bytes arrive;
    /// a phase waiting on input consumes nothing until its full unit is
    /// buffered. The first call on the server role queues the version
    /// banner even if `inbound` is empty.
    ///
    /// # Errors
    ///
    /// * [`RfbError::ProtocolViolation`] on bad banner magic or a
    ///   malformed ServerInit.
    /// * [`RfbError::SecurityRejected`] when the peer offers no usable
    ///   security type or reports a nonzero security result.
    pub fn advance(&mut self, inbound: &mut BytesMut, outbound: &mut BytesMut) -> Result<HandshakeState> {
        loop {
            match (self.state, self.role) {
                (HandshakeState::ProtocolVersionExchange, Role::Server) => {
                    if !self.banner_sent {
                        outbound.put_slice(encode_protocol_banner());
                        self.banner_sent = true;
                    }
                    if inbound.len() < 12 {
                        return Ok(self.state);
                    }
                    trace!(
                        "client banner: {:?}",
                        String::from_utf8_lossy(&inbound[..12])
                    );
                    inbound.advance(12);
                    self.state = HandshakeState::SecurityNegotiation;
                    // One security type on offer: None.
                    outbound.put_slice(&[1, SECURITY_TYPE_NONE]);
                }
                (HandshakeState::ProtocolVersionExchange, Role::Client) => {
                    if inbound.len() < 12 {
                        return Ok(self.state);
                    }
                    if &inbound[..4] != b"RFB " {
                        return Err(RfbError::ProtocolViolation(format!(
                            "bad protocol banner: {:?}",
                            String::from_utf8_lossy(&inbound[..12])
                        )));
                    }
                    debug!(
                        "server banner: {:?}",
                        String::from_utf8_lossy(&inbound[..12])
                    );
                    inbound.advance(12);
                    outbound.put_slice(encode_protocol_banner());
                    self.state = HandshakeState::SecurityNegotiation;
                }
                (HandshakeState::SecurityNegotiation, Role::Server) => {
                    if inbound.is_empty() {
                        return Ok(self.state);
                    }
                    // The chosen type; None is the only thing we offered.
                    let choice = inbound.get_u8();
                    trace!("client chose security type {choice}");
                    self.state = HandshakeState::SecurityResult;
                    outbound.put_u32(SECURITY_RESULT_OK);
                }
                (HandshakeState::SecurityNegotiation, Role::Client) => {
                    let Some(&count) = inbound.first() else {
                        return Ok(self.state);
                    };
                    if count == 0 {
                        return Err(RfbError::SecurityRejected(
                            "no security types offered by server".to_string(),
                        ));
                    }
                    if inbound.len() < 1 + count as usize {
                        return Ok(self.state);
                    }
                    let (_, types) = decode_security_types(inbound)?;
                    if !types.contains(&SECURITY_TYPE_NONE) {
                        return Err(RfbError::SecurityRejected(
                            "server does not support no-authentication (type 1)".to_string(),
                        ));
                    }
                    inbound.advance(1 + count as usize);
                    outbound.put_u8(SECURITY_TYPE_NONE);
                    self.state = HandshakeState::SecurityResult;
                }
                (HandshakeState::SecurityResult, Role::Server) => {
                    // Result already queued; nothing to read on success.
                    self.state = HandshakeState::ClientInit;
                }
                (HandshakeState::SecurityResult, Role::Client) => {
                    if inbound.len() < 4 {
                        return Ok(self.state);
                    }
                    let result = inbound.get_u32();
                    if result != SECURITY_RESULT_OK {
                        return Err(RfbError::SecurityRejected(format!(
                            "server returned security result {result}"
                        )));
                    }
                    self.state = HandshakeState::ClientInit;
                    outbound.put_u8(1); // shared-session flag
                }
                (HandshakeState::ClientInit, Role::Server) => {
                    if inbound.is_empty() {
                        return Ok(self.state);
                    }
                    inbound.advance(1); // shared-session flag, ignored
                    self.state = HandshakeState::ServerInit;
                    if let Some(init) = &self.server_init {
                        init.write_to(outbound);
                        debug!(
                            "announced {}x{} \"{}\"",
                            init.width, init.height, init.name
                        );
                    }
                }
                (HandshakeState::ClientInit, Role::Client) => {
                    // Our init byte is already queued.
                    self.state = HandshakeState::ServerInit;
                }
                (HandshakeState::ServerInit, Role::Server) => {
                    self.state = HandshakeState::Established;
                }
                (HandshakeState::ServerInit, Role::Client) => {
                    let Some((init, consumed)) = decode_server_init(inbound)? else {
                        return Ok(self.state);
                    };
                    inbound.advance(consumed);
                    debug!(
                        "server reports {}x{} \"{}\"",
                        init.width, init.height, init.name
                    );
                    self.server_init = Some(init);
                    self.state = HandshakeState::Established;
                }
                (HandshakeState::Established, _) => return Ok(self.state),
            }
        }
    }
}
