//! Bind / Search / Close handlers

use async_trait::async_trait;
use futures::FutureExt;
use ldap_proxy_backend::BackendConnector;
use ldap_proxy_core::config::SessionConfig;
use ldap_proxy_core::types::{DerefAliases, SearchOutcome, SearchRequest, SearchScope};
use ldap_proxy_core::{ProxyError, Result};
use metrics::{counter, gauge};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connection::ClientConnection;
use crate::identity::ConnectionId;
use crate::names;
use crate::session::{ClientEndpoints, Session};
use crate::store::SessionStore;

/// Capability set the dispatcher drives for every client connection
#[async_trait]
pub trait DirectoryHandler: Send + Sync {
    /// Forward a simple bind to the connection's upstream
    async fn bind(&self, dn: &str, password: &str, conn: &dyn ClientConnection) -> Result<()>;

    /// Run a search upstream. `bound_dn` is informational.
    async fn search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        conn: &dyn ClientConnection,
    ) -> Result<SearchOutcome>;

    /// Tear down the client connection and its session
    async fn close(&self, conn: &dyn ClientConnection) -> Result<()>;
}

/// Default handler: one lazily dialed upstream connection per client
pub struct SessionHandler {
    connector: Arc<dyn BackendConnector>,
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionHandler {
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        store: Arc<dyn SessionStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            connector,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get or create the session of `conn`, re-arming its deadline
    pub async fn session_for(&self, conn: &dyn ClientConnection) -> Result<Arc<Session>> {
        match Instant::now().checked_add(self.config.client_timeout()) {
            Some(deadline) => conn.set_deadline(deadline),
            None => warn!(
                "Client timeout of {}s is out of range, leaving the deadline unchanged",
                self.config.client_timeout_secs
            ),
        }

        let client = ClientEndpoints {
            local: conn.local_addr(),
            peer: conn.peer_addr(),
        };
        let id = ConnectionId::derive(&client.local, &client.peer);

        if let Some(session) = self.store.lookup(&id) {
            return Ok(session);
        }

        debug!(
            "No session for {} ({}), dialing {}",
            client.peer,
            id.short(),
            self.connector.endpoint()
        );

        let backend = match self.connector.connect().await {
            Ok(backend) => {
                counter!(names::BACKEND_DIALS_TOTAL, "outcome" => "success").increment(1);
                backend
            }
            Err(e) => {
                counter!(names::BACKEND_DIALS_TOTAL, "outcome" => "failure").increment(1);
                warn!(
                    "Upstream {} unreachable for {}: {}",
                    self.connector.endpoint(),
                    client.peer,
                    e
                );
                return Err(ProxyError::Connect(e));
            }
        };

        let session = Arc::new(Session::new(id, client, backend));
        if let Some(displaced) = self.store.insert(session.clone()) {
            warn!(
                "Session {} replaced an existing entry, closing the old upstream connection",
                session.id().short()
            );
            displaced.close().await;
        }
        self.update_gauge();

        Ok(session)
    }

    /// Upstream request with the proxy's fixed search parameters
    pub fn upstream_request(&self, request: &SearchRequest) -> SearchRequest {
        SearchRequest::new(
            request.base_dn.clone(),
            request.filter.clone(),
            request.attributes.clone(),
        )
        .with_scope(SearchScope::WholeSubtree)
        .with_deref(DerefAliases::Never)
        .with_limits(self.config.size_limit, self.config.time_limit_secs)
    }

    /// Close every remaining session
    pub async fn shutdown(&self) {
        let sessions = self.store.drain();
        if !sessions.is_empty() {
            info!("Closing {} remaining session(s)", sessions.len());
        }
        for session in sessions {
            session.close().await;
        }
        self.update_gauge();
    }

    fn update_gauge(&self) {
        gauge!(names::SESSIONS_ACTIVE).set(self.store.len() as f64);
    }

    async fn do_bind(&self, dn: &str, password: &str, conn: &dyn ClientConnection) -> Result<()> {
        let session = self.session_for(conn).await?;

        match session.backend().simple_bind(dn, password).await {
            Ok(()) => {
                debug!("Bind OK: {} ({})", dn, session.id().short());
                Ok(())
            }
            Err(e) => {
                debug!("Bind failed: {} ({}): {}", dn, session.id().short(), e);
                Err(ProxyError::Auth(e))
            }
        }
    }

    async fn do_search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        conn: &dyn ClientConnection,
    ) -> Result<SearchOutcome> {
        let session = self.session_for(conn).await?;
        let upstream = self.upstream_request(request);

        debug!(
            "Search by {:?}: base={} filter={} attrs={:?}",
            bound_dn, upstream.base_dn, upstream.filter, upstream.attributes
        );

        let entries = session
            .backend()
            .paged_search(&upstream, self.config.page_size)
            .await
            .map_err(|e| {
                debug!("Search failed ({}): {}", session.id().short(), e);
                ProxyError::Search(e)
            })?;

        debug!(
            "Search OK: {} -> num of entries = {}",
            upstream.filter,
            entries.len()
        );
        Ok(SearchOutcome::success(entries))
    }
}

#[async_trait]
impl DirectoryHandler for SessionHandler {
    async fn bind(&self, dn: &str, password: &str, conn: &dyn ClientConnection) -> Result<()> {
        guarded("bind", self.do_bind(dn, password, conn)).await
    }

    async fn search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        conn: &dyn ClientConnection,
    ) -> Result<SearchOutcome> {
        guarded("search", self.do_search(bound_dn, request, conn)).await
    }

    async fn close(&self, conn: &dyn ClientConnection) -> Result<()> {
        conn.close();

        let id = ConnectionId::derive(&conn.local_addr(), &conn.peer_addr());
        if let Some(session) = self.store.remove(&id) {
            self.update_gauge();
            session.close().await;
        }
        Ok(())
    }
}

/// Run a handler body, turning a panic into [`ProxyError::InternalFault`]
async fn guarded<T, F>(op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            counter!(names::INTERNAL_FAULTS_TOTAL, "operation" => op).increment(1);
            error!("Internal fault in {} handler: {}", op, message);
            Err(ProxyError::InternalFault(format!("{}: {}", op, message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
