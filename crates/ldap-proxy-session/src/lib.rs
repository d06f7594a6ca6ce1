//! ldap-proxy Session Layer
//!
//! # Architecture
//!
//! ```text
//!   client event ──► DirectoryHandler (bind / search / close)
//!                          │
//!                          ▼
//!                  ConnectionId::derive(local, peer)
//!                          │
//!                          ▼
//!                    SessionStore ──miss──► BackendConnector::connect
//!                          │                        │
//!                          ◄──────── insert ────────┘
//!                          │
//!                          ▼
//!              Session.backend (one per client connection)
//! ```
//!
//! The store lock is only held for map access; dialing and every forwarded
//! operation run outside it.

mod connection;
mod handler;
mod identity;
mod session;
mod store;

pub use connection::ClientConnection;
pub use handler::{DirectoryHandler, SessionHandler};
pub use identity::ConnectionId;
pub use session::{ClientEndpoints, Session};
pub use store::{InMemorySessionStore, SessionStore};

/// Metric names emitted by the session layer
pub mod names {
    pub const SESSIONS_ACTIVE: &str = "ldap_proxy_sessions_active";
    pub const BACKEND_DIALS_TOTAL: &str = "ldap_proxy_backend_dials_total";
    pub const INTERNAL_FAULTS_TOTAL: &str = "ldap_proxy_internal_faults_total";
}
