//! Proxy server wiring

use ldap_proxy_backend::{BackendConnector, LdapConnector};
use ldap_proxy_core::{ProxyConfig, ProxyError};
use ldap_proxy_session::{InMemorySessionStore, SessionHandler, SessionStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::admin::{self, AdminState};
use crate::listener::Listener;
use crate::metrics::MetricsRecorder;

/// LDAP proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    connector: Arc<dyn BackendConnector>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let connector = Arc::new(LdapConnector::new(config.upstream.clone()));
        Self::with_connector(config, connector)
    }

    /// Use a different upstream connector
    pub fn with_connector(config: ProxyConfig, connector: Arc<dyn BackendConnector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            config,
            connector,
            shutdown_tx,
        }
    }

    /// Sender that stops the server when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let start_time = Instant::now();

        let store: Arc<dyn SessionStore> = InMemorySessionStore::shared();
        let handler = Arc::new(SessionHandler::new(
            Arc::clone(&self.connector),
            Arc::clone(&store),
            self.config.session.clone(),
        ));

        info!(
            "Upstream directory: {} (connect timeout {}s, StartTLS {})",
            self.connector.endpoint(),
            self.config.upstream.connect_timeout_secs,
            self.config.upstream.starttls
        );

        let admin_task = if self.config.metrics.enabled {
            let metrics = MetricsRecorder::install()?;
            info!("Prometheus metrics initialized");

            let state = AdminState {
                metrics: Some(metrics),
                store: Arc::clone(&store),
                start_time,
            };
            let addr = self.config.metrics.listen_addr();
            let shutdown_rx = self.shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = admin::serve(&addr, state, shutdown_rx).await {
                    error!("Admin endpoint failed: {}", e);
                }
            }))
        } else {
            None
        };

        let signal_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                let _ = signal_tx.send(());
            }
        });

        let listener = Listener::bind(
            &self.config.server,
            handler.clone(),
            self.config.session.fault_policy,
            self.shutdown_tx.clone(),
        )
        .await?;

        let result = listener.run().await;

        // Stop anything still waiting on the signal (admin endpoint, clients)
        let _ = self.shutdown_tx.send(());
        handler.shutdown().await;
        if let Some(task) = admin_task {
            let _ = task.await;
        }

        info!("ldap-proxy stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::FutureExt;
    use ldap3::exop::{WhoAmI, WhoAmIResp};
    use ldap3::{LdapConnAsync, Scope, SearchEntry};
    use ldap_proxy_backend::BackendConnection;
    use ldap_proxy_core::config::{FaultPolicy, ServerConfig, SessionConfig};
    use ldap_proxy_core::types::{Attribute, Entry, ResultCode, SearchRequest, SearchScope};
    use ldap_proxy_core::BackendError;
    use ldap_proxy_session::{ClientConnection, DirectoryHandler};
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const ADMIN_DN: &str = "cn=admin,dc=example,dc=com";
    const ADMIN_PW: &str = "secret";

    #[derive(Default)]
    struct Upstream {
        dials: AtomicUsize,
        closed: AtomicUsize,
        searches: Mutex<Vec<(SearchRequest, i32)>>,
        panic_on_bind: AtomicBool,
    }

    struct FakeConnection {
        upstream: Arc<Upstream>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl BackendConnection for FakeConnection {
        async fn simple_bind(&self, dn: &str, password: &str) -> Result<(), BackendError> {
            if self.upstream.panic_on_bind.load(Ordering::SeqCst) {
                panic!("upstream state corrupted");
            }
            if dn == ADMIN_DN && password == ADMIN_PW {
                Ok(())
            } else {
                Err(BackendError::Result {
                    code: ResultCode::InvalidCredentials,
                    message: "invalid credentials".to_string(),
                })
            }
        }

        async fn paged_search(
            &self,
            request: &SearchRequest,
            page_size: i32,
        ) -> Result<Vec<Entry>, BackendError> {
            self.upstream.searches.lock().push((request.clone(), page_size));
            Ok((0..100)
                .map(|i| {
                    Entry::new(
                        format!("uid=user{},{}", i, request.base_dn),
                        vec![
                            Attribute::text("objectClass", ["person"]),
                            Attribute::text("uid", [format!("user{}", i)]),
                        ],
                    )
                })
                .collect())
        }

        async fn close(&self) -> Result<(), BackendError> {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.upstream.closed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct FakeConnector(Arc<Upstream>);

    #[async_trait]
    impl BackendConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
            self.0.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                upstream: Arc::clone(&self.0),
                closed: AtomicBool::new(false),
            }))
        }

        fn endpoint(&self) -> String {
            "fake:389".to_string()
        }
    }

    struct Running {
        addr: SocketAddr,
        upstream: Arc<Upstream>,
        store: Arc<InMemorySessionStore>,
        shutdown_tx: broadcast::Sender<()>,
        task: tokio::task::JoinHandle<Result<(), ProxyError>>,
    }

    async fn start(fault_policy: FaultPolicy) -> Running {
        start_with(SessionConfig {
            fault_policy,
            ..Default::default()
        })
        .await
    }

    async fn start_with(session: SessionConfig) -> Running {
        let fault_policy = session.fault_policy;
        let upstream = Arc::new(Upstream::default());
        let store = InMemorySessionStore::shared();
        let handler: Arc<dyn DirectoryHandler> = Arc::new(SessionHandler::new(
            Arc::new(FakeConnector(Arc::clone(&upstream))),
            store.clone(),
            session,
        ));

        let (shutdown_tx, _) = broadcast::channel(4);
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 0,
        };
        let listener = Listener::bind(&config, handler, fault_policy, shutdown_tx.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(listener.run());

        Running {
            addr,
            upstream,
            store,
            shutdown_tx,
            task,
        }
    }

    async fn client(addr: SocketAddr) -> ldap3::Ldap {
        let (conn, ldap) = LdapConnAsync::new(&format!("ldap://{}", addr)).await.unwrap();
        tokio::spawn(async move {
            let _ = conn.drive().await;
        });
        ldap
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_bind_search_unbind_through_listener() {
        let server = start(FaultPolicy::Isolate).await;
        let mut ldap = client(server.addr).await;

        ldap.simple_bind(ADMIN_DN, ADMIN_PW)
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(server.store.len(), 1);

        let (entries, _res) = ldap
            .search("dc=example,dc=com", Scope::OneLevel, "(objectClass=*)", vec!["uid"])
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(entries.len(), 100);
        let first = SearchEntry::construct(entries[0].clone());
        assert_eq!(first.dn, "uid=user0,dc=example,dc=com");
        assert_eq!(first.attrs["uid"], vec!["user0".to_string()]);

        {
            let searches = server.upstream.searches.lock();
            assert_eq!(searches.len(), 1);
            assert_eq!(searches[0].0.scope, SearchScope::WholeSubtree);
            assert_eq!(searches[0].0.filter, "(objectClass=*)");
            assert_eq!(searches[0].1, 64);
        }

        ldap.unbind().await.unwrap();

        let store = server.store.clone();
        assert!(eventually(|| store.is_empty()).await);
        let upstream = server.upstream.clone();
        assert!(eventually(|| upstream.closed.load(Ordering::SeqCst) == 1).await);
        assert_eq!(server.upstream.dials.load(Ordering::SeqCst), 1);

        server.shutdown_tx.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_client_is_dropped_after_deadline() {
        let server = start_with(SessionConfig {
            client_timeout_secs: 1,
            ..Default::default()
        })
        .await;
        let mut ldap = client(server.addr).await;

        ldap.simple_bind(ADMIN_DN, ADMIN_PW)
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(server.store.len(), 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;

        let store = server.store.clone();
        assert!(eventually(|| store.is_empty()).await);
        let upstream = server.upstream.clone();
        assert!(eventually(|| upstream.closed.load(Ordering::SeqCst) == 1).await);

        // The proxy hung up, so the next request cannot succeed
        let outcome = ldap
            .with_timeout(Duration::from_secs(2))
            .simple_bind(ADMIN_DN, ADMIN_PW)
            .await;
        assert!(outcome.is_err() || outcome.unwrap().rc != 0);
        assert_eq!(server.upstream.dials.load(Ordering::SeqCst), 1);

        server.shutdown_tx.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_through_listener() {
        let server = start(FaultPolicy::Isolate).await;
        let mut ldap = client(server.addr).await;

        let res = ldap.simple_bind(ADMIN_DN, "wrong").await.unwrap();
        assert_eq!(res.rc, 49);

        server.shutdown_tx.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    async fn whoami(ldap: &mut ldap3::Ldap) -> String {
        let (exop, _res) = ldap.extended(WhoAmI).await.unwrap().success().unwrap();
        exop.parse::<WhoAmIResp>().authzid
    }

    #[tokio::test]
    async fn test_failed_rebind_clears_identity() {
        let server = start(FaultPolicy::Isolate).await;
        let mut ldap = client(server.addr).await;

        ldap.simple_bind(ADMIN_DN, ADMIN_PW)
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(whoami(&mut ldap).await, format!("dn: {}", ADMIN_DN));

        let res = ldap.simple_bind(ADMIN_DN, "wrong").await.unwrap();
        assert_eq!(res.rc, 49);
        assert_eq!(whoami(&mut ldap).await, "dn: ");

        server.shutdown_tx.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    /// Hangs up on clients whose bind is rejected
    struct HangUpOnReject(SessionHandler);

    #[async_trait]
    impl DirectoryHandler for HangUpOnReject {
        async fn bind(
            &self,
            dn: &str,
            password: &str,
            conn: &dyn ClientConnection,
        ) -> Result<(), ProxyError> {
            let result = self.0.bind(dn, password, conn).await;
            if result.is_err() {
                self.0.close(conn).await?;
            }
            result
        }

        async fn search(
            &self,
            bound_dn: &str,
            request: &SearchRequest,
            conn: &dyn ClientConnection,
        ) -> Result<ldap_proxy_core::types::SearchOutcome, ProxyError> {
            self.0.search(bound_dn, request, conn).await
        }

        async fn close(&self, conn: &dyn ClientConnection) -> Result<(), ProxyError> {
            self.0.close(conn).await
        }
    }

    #[tokio::test]
    async fn test_handler_close_ends_connection() {
        let upstream = Arc::new(Upstream::default());
        let store = InMemorySessionStore::shared();
        let handler: Arc<dyn DirectoryHandler> = Arc::new(HangUpOnReject(SessionHandler::new(
            Arc::new(FakeConnector(Arc::clone(&upstream))),
            store.clone(),
            SessionConfig::default(),
        )));
        let (shutdown_tx, _) = broadcast::channel(4);
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 0,
        };
        let listener = Listener::bind(&config, handler, FaultPolicy::Isolate, shutdown_tx.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = listener.stats();
        let task = tokio::spawn(listener.run());

        let mut ldap = client(addr).await;
        let res = ldap.simple_bind(ADMIN_DN, "wrong").await.unwrap();
        assert_eq!(res.rc, 49);

        assert!(eventually(|| stats.connections_active.load(Ordering::Relaxed) == 0).await);
        assert!(store.is_empty());
        assert_eq!(upstream.closed.load(Ordering::SeqCst), 1);

        let outcome = ldap
            .with_timeout(Duration::from_secs(2))
            .simple_bind(ADMIN_DN, ADMIN_PW)
            .await;
        assert!(outcome.is_err() || outcome.unwrap().rc != 0);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_isolated_fault_keeps_serving() {
        let server = start(FaultPolicy::Isolate).await;
        server.upstream.panic_on_bind.store(true, Ordering::SeqCst);

        let mut ldap = client(server.addr).await;
        let outcome = ldap
            .with_timeout(Duration::from_secs(5))
            .simple_bind(ADMIN_DN, ADMIN_PW)
            .await;
        assert!(outcome.is_err() || outcome.unwrap().rc != 0);

        let store = server.store.clone();
        assert!(eventually(|| store.is_empty()).await);

        // Other clients are still served
        server.upstream.panic_on_bind.store(false, Ordering::SeqCst);
        let mut other = client(server.addr).await;
        other
            .simple_bind(ADMIN_DN, ADMIN_PW)
            .await
            .unwrap()
            .success()
            .unwrap();
        assert!(server.task.now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_halt_policy_stops_listener() {
        let server = start(FaultPolicy::Halt).await;
        server.upstream.panic_on_bind.store(true, Ordering::SeqCst);

        let mut ldap = client(server.addr).await;
        let _ = ldap
            .with_timeout(Duration::from_secs(5))
            .simple_bind(ADMIN_DN, ADMIN_PW)
            .await;

        let result = tokio::time::timeout(Duration::from_secs(5), server.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProxyError::InternalFault(_))));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let upstream = Arc::new(Upstream::default());
        let handler: Arc<dyn DirectoryHandler> = Arc::new(SessionHandler::new(
            Arc::new(FakeConnector(Arc::clone(&upstream))),
            InMemorySessionStore::shared(),
            SessionConfig::default(),
        ));
        let (shutdown_tx, _) = broadcast::channel(4);
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 1,
        };
        let listener = Listener::bind(&config, handler, FaultPolicy::Isolate, shutdown_tx.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = listener.stats();
        let task = tokio::spawn(listener.run());

        let _held = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(eventually(|| stats.connections_active.load(Ordering::Relaxed) == 1).await);
        let _rejected = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(eventually(|| stats.connections_rejected.load(Ordering::Relaxed) == 1).await);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
