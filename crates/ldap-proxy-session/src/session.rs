//! Client-to-backend pairing

use chrono::{DateTime, Utc};
use ldap_proxy_backend::BackendConnection;
use tracing::{debug, warn};

use crate::identity::ConnectionId;

/// Endpoint pair of the client connection a session belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEndpoints {
    pub local: String,
    pub peer: String,
}

/// One client connection and its dedicated upstream connection
pub struct Session {
    id: ConnectionId,
    client: ClientEndpoints,
    backend: Box<dyn BackendConnection>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        client: ClientEndpoints,
        backend: Box<dyn BackendConnection>,
    ) -> Self {
        Self {
            id,
            client,
            backend,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn client(&self) -> &ClientEndpoints {
        &self.client
    }

    pub fn backend(&self) -> &dyn BackendConnection {
        self.backend.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Release the upstream connection. Failures are logged, not returned.
    pub async fn close(&self) {
        match self.backend.close().await {
            Ok(()) => debug!(
                "Session {} for {} closed after {}s",
                self.id.short(),
                self.client.peer,
                (Utc::now() - self.created_at).num_seconds()
            ),
            Err(e) => warn!(
                "Session {} for {}: upstream close failed: {}",
                self.id.short(),
                self.client.peer,
                e
            ),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("backend_closed", &self.backend.is_closed())
            .field("created_at", &self.created_at)
            .finish()
    }
}
