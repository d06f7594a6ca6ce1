//! Session store
//!
//! A single coarse lock guards the map. It is held for the map operation
//! only and is never held across an await point.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::identity::ConnectionId;
use crate::session::Session;

/// Concurrency-safe mapping from connection fingerprint to session
pub trait SessionStore: Send + Sync {
    fn lookup(&self, id: &ConnectionId) -> Option<Arc<Session>>;

    /// Insert under the session's id, returning any session it displaced
    fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>>;

    /// Remove and return the session; `None` if absent
    fn remove(&self, id: &ConnectionId) -> Option<Arc<Session>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session (shutdown)
    fn drain(&self) -> Vec<Arc<Session>>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<ConnectionId, Arc<Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl SessionStore for InMemorySessionStore {
    fn lookup(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.lock().insert(session.id().clone(), session)
    }

    fn remove(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.sessions.lock().remove(id)
    }

    fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientEndpoints;
    use async_trait::async_trait;
    use ldap_proxy_backend::BackendConnection;
    use ldap_proxy_core::types::{Entry, SearchRequest};
    use ldap_proxy_core::BackendError;

    struct NullBackend;

    #[async_trait]
    impl BackendConnection for NullBackend {
        async fn simple_bind(&self, _dn: &str, _password: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn paged_search(
            &self,
            _request: &SearchRequest,
            _page_size: i32,
        ) -> Result<Vec<Entry>, BackendError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<(), BackendError> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn session(local: &str, peer: &str) -> Arc<Session> {
        Arc::new(Session::new(
            ConnectionId::derive(local, peer),
            ClientEndpoints {
                local: local.to_string(),
                peer: peer.to_string(),
            },
            Box::new(NullBackend),
        ))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let store = InMemorySessionStore::new();
        let s = session("127.0.0.1:389", "127.0.0.1:50000");
        let id = s.id().clone();

        assert!(store.lookup(&id).is_none());
        assert!(store.insert(s.clone()).is_none());
        assert_eq!(store.len(), 1);

        let found = store.lookup(&id).unwrap();
        assert!(Arc::ptr_eq(&found, &s));

        assert!(store.remove(&id).is_some());
        assert!(store.is_empty());

        // Removing an absent id is a no-op
        assert!(store.remove(&id).is_none());
    }

    #[test]
    fn test_insert_overwrites_same_id() {
        let store = InMemorySessionStore::new();
        let first = session("127.0.0.1:389", "127.0.0.1:50001");
        let second = session("127.0.0.1:389", "127.0.0.1:50001");

        store.insert(first.clone());
        let displaced = store.insert(second.clone()).unwrap();

        assert!(Arc::ptr_eq(&displaced, &first));
        assert_eq!(store.len(), 1);
        assert!(Arc::ptr_eq(&store.lookup(second.id()).unwrap(), &second));
    }

    #[test]
    fn test_drain() {
        let store = InMemorySessionStore::new();
        for port in 50000..50005 {
            store.insert(session("127.0.0.1:389", &format!("127.0.0.1:{}", port)));
        }

        assert_eq!(store.drain().len(), 5);
        assert!(store.is_empty());
    }
}
