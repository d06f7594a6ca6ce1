//! Connection fingerprints

use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identity of a client connection.
///
/// SHA-256 over the local endpoint followed by the remote endpoint,
/// hex encoded. Used only as a session lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn derive(local_addr: &str, peer_addr: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(local_addr.as_bytes());
        hasher.update(peer_addr.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
