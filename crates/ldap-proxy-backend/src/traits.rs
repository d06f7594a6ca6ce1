//! Backend connector traits
//!
//! Defines the interface the session layer uses to reach the upstream
//! directory. The production implementation lives in [`crate::ldap`].

use async_trait::async_trait;
use ldap_proxy_core::types::{Entry, SearchRequest};
use ldap_proxy_core::BackendError;

/// Opens dedicated upstream connections
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Dial the configured upstream. Called once per new session, never retried.
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError>;

    /// `host:port` of the upstream, for logging
    fn endpoint(&self) -> String;
}

/// One live upstream connection, exclusively owned by a session
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Forward a simple bind verbatim
    async fn simple_bind(&self, dn: &str, password: &str) -> Result<(), BackendError>;

    /// Run `request` with paging, accumulating every page
    async fn paged_search(
        &self,
        request: &SearchRequest,
        page_size: i32,
    ) -> Result<Vec<Entry>, BackendError>;

    /// Unbind and release the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), BackendError>;

    fn is_closed(&self) -> bool;
}
