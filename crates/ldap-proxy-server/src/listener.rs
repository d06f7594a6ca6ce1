//! TCP listener for incoming LDAP clients

use ldap_proxy_core::config::{FaultPolicy, ServerConfig};
use ldap_proxy_core::ProxyError;
use ldap_proxy_session::DirectoryHandler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::connection::ClientSession;
use crate::metrics;

/// Listener statistics
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections rejected due to limit
    pub connections_rejected: AtomicU64,
    /// Fault that halted the service, if any
    halted: Mutex<Option<String>>,
}

impl ListenerStats {
    pub fn halted(&self) -> Option<String> {
        self.halted.lock().clone()
    }
}

/// Accepts clients and runs one [`ClientSession`] task per connection
pub struct Listener {
    listener: TcpListener,
    handler: Arc<dyn DirectoryHandler>,
    fault_policy: FaultPolicy,
    max_connections: usize,
    stats: Arc<ListenerStats>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Listener {
    /// Bind to the configured address
    pub async fn bind(
        config: &ServerConfig,
        handler: Arc<dyn DirectoryHandler>,
        fault_policy: FaultPolicy,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self, ProxyError> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr).await?;

        // 0 = unlimited
        let connection_semaphore = if config.max_connections > 0 {
            info!(
                "Listening on {} (max {} connections)",
                addr, config.max_connections
            );
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            info!("Listening on {} (unlimited connections)", addr);
            None
        };

        Ok(Self {
            listener,
            handler,
            fault_policy,
            max_connections: config.max_connections,
            stats: Arc::new(ListenerStats::default()),
            shutdown_rx: shutdown_tx.subscribe(),
            shutdown_tx,
            connection_semaphore,
        })
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Useful when bound to port 0
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until shutdown. Returns the fault if the
    /// service was halted by one.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let permit = if let Some(ref semaphore) = self.connection_semaphore {
                                match semaphore.clone().try_acquire_owned() {
                                    Ok(permit) => Some(permit),
                                    Err(_) => {
                                        warn!(
                                            "Connection from {} rejected: max connections ({}) reached",
                                            peer, self.max_connections
                                        );
                                        self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                        metrics::record_connection_rejected();
                                        drop(stream);
                                        continue;
                                    }
                                }
                            } else {
                                None
                            };

                            let local = match stream.local_addr() {
                                Ok(local) => local,
                                Err(e) => {
                                    warn!("Dropping connection from {}: {}", peer, e);
                                    continue;
                                }
                            };

                            debug!("Accepted connection from {}", peer);
                            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                            let active = self.stats.connections_active.fetch_add(1, Ordering::Relaxed) + 1;
                            metrics::record_connection_accepted();
                            metrics::set_active_connections(active);

                            let session = ClientSession::new(
                                Arc::clone(&self.handler),
                                local,
                                peer,
                                self.fault_policy,
                            );
                            let stats = Arc::clone(&self.stats);
                            let shutdown_tx = self.shutdown_tx.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                // Hold permit for connection lifetime
                                let _permit = permit;

                                if let Err(fault) = session.run(stream, shutdown_rx).await {
                                    stats.halted.lock().get_or_insert_with(|| fault.to_string());
                                    let _ = shutdown_tx.send(());
                                }

                                let active = stats.connections_active.fetch_sub(1, Ordering::Relaxed) - 1;
                                metrics::set_active_connections(active);
                                debug!("Connection from {} closed", peer);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        info!(
            "Listener stopped. Total: {}, Active: {}, Rejected: {}",
            self.stats.connections_accepted.load(Ordering::Relaxed),
            self.stats.connections_active.load(Ordering::Relaxed),
            self.stats.connections_rejected.load(Ordering::Relaxed)
        );

        match self.stats.halted() {
            Some(fault) => Err(ProxyError::InternalFault(fault)),
            None => Ok(()),
        }
    }
}
