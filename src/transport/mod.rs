/// In-memory duplex endpoints (read, write, close) with no OS I/O.
pub mod duplex;

/// Single-assignment cross-task flags.
pub mod signal;

use std::fmt;

pub use duplex::{duplex, DuplexEndpoint, TransportPair};
pub use signal::Signal;

/// Which side of a handshake an endpoint belongs to.
///
/// Used for diagnostics only; no transport behaviour depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a written chunk is handed to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Zero-capacity hand-off: a write completes only once the peer has read
    /// the whole chunk, like a socket with no kernel buffer.
    #[default]
    Rendezvous,
    /// Unbounded queue: a write completes as soon as the chunk is queued.
    Buffered,
}
