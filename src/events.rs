//! Server events that can be received by the application.

use std::net::SocketAddr;

/// Events emitted by the RFB server.
///
/// Only connection lifecycle is reported; input transport (keyboard,
/// pointer, clipboard) is not part of this engine.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A viewer has connected to the server.
    ClientConnected {
        /// Unique client identifier.
        id: usize,
        /// Client's socket address.
        address: SocketAddr,
    },

    /// A viewer has disconnected from the server.
    ClientDisconnected {
        /// Unique client identifier.
        id: usize,
    },
}
