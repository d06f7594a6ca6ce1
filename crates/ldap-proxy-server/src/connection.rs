//! Per-client connection task
//!
//! Decodes requests with `ldap3_proto`, hands them to the directory handler
//! and writes the replies back. Every read and write observes the deadline
//! the handler arms at the start of each Bind and Search.

use futures::{SinkExt, StreamExt};
use ldap3_proto::simple::{
    DisconnectionNotice, LdapMsg, LdapPartialAttribute, LdapResultCode, LdapSearchResultEntry,
    LdapSearchScope, SearchRequest as WireSearchRequest, ServerOps, SimpleBindRequest,
};
use ldap3_proto::LdapCodec;
use ldap_proxy_core::config::FaultPolicy;
use ldap_proxy_core::types::{Entry, ResultCode, SearchRequest, SearchScope};
use ldap_proxy_core::ProxyError;
use ldap_proxy_session::{ClientConnection, DirectoryHandler};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{error::Elapsed, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filter;
use crate::metrics;

/// Client side of one accepted connection, as handed to the handler
pub(crate) struct ClientHandle {
    local: SocketAddr,
    peer: SocketAddr,
    deadline: Mutex<Option<Instant>>,
    closed: CancellationToken,
}

impl ClientHandle {
    pub(crate) fn new(local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            local,
            peer,
            deadline: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Run a socket operation under the current deadline
    pub(crate) async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        match self.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, fut).await,
            None => Ok(fut.await),
        }
    }
}

impl ClientConnection for ClientHandle {
    fn local_addr(&self) -> String {
        self.local.to_string()
    }

    fn peer_addr(&self) -> String {
        self.peer.to_string()
    }

    fn set_deadline(&self, deadline: std::time::Instant) {
        *self.deadline.lock() = Some(Instant::from_std(deadline));
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Why the read loop stopped
enum Exit {
    Eof,
    Unbind,
    Deadline,
    Closed,
    Shutdown,
    Protocol,
    WriteFailed,
    Fault(ProxyError),
}

/// One client connection being served
pub(crate) struct ClientSession {
    handler: Arc<dyn DirectoryHandler>,
    handle: ClientHandle,
    fault_policy: FaultPolicy,
    bound_dn: String,
}

impl ClientSession {
    pub(crate) fn new(
        handler: Arc<dyn DirectoryHandler>,
        local: SocketAddr,
        peer: SocketAddr,
        fault_policy: FaultPolicy,
    ) -> Self {
        Self {
            handler,
            handle: ClientHandle::new(local, peer),
            fault_policy,
            bound_dn: String::new(),
        }
    }

    /// Serve the connection until it ends. An internal fault is returned only
    /// under [`FaultPolicy::Halt`].
    pub(crate) async fn run(
        mut self,
        stream: TcpStream,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ProxyError> {
        let (r, w) = stream.into_split();
        let mut reqs = FramedRead::new(r, LdapCodec::default());
        let mut resp = FramedWrite::new(w, LdapCodec::default());
        let closed = self.handle.closed.clone();

        let exit = loop {
            // A handler may close the client while serving the previous request
            let next = tokio::select! {
                biased;
                _ = closed.cancelled() => break Exit::Closed,
                next = self.handle.bounded(reqs.next()) => next,
                _ = shutdown_rx.recv() => break Exit::Shutdown,
            };

            let msg = match next {
                Err(_) => break Exit::Deadline,
                Ok(None) => break Exit::Eof,
                Ok(Some(msg)) => msg,
            };

            let op = match msg.map_err(|_| ()).and_then(ServerOps::try_from) {
                Ok(op) => op,
                Err(()) => {
                    let notice = DisconnectionNotice::gen(
                        LdapResultCode::ProtocolError,
                        "Unsupported or malformed request",
                    );
                    let _ = self.handle.bounded(resp.send(notice)).await;
                    break Exit::Protocol;
                }
            };

            let replies = match op {
                ServerOps::SimpleBind(sbr) => self.bind(&sbr).await,
                ServerOps::Search(sr) => self.search(&sr).await,
                ServerOps::Unbind(_) => break Exit::Unbind,
                ServerOps::Compare(cr) => Ok(vec![cr.gen_error(
                    LdapResultCode::UnwillingToPerform,
                    "Compare is not supported by this proxy".to_string(),
                )]),
                ServerOps::Whoami(wr) => Ok(vec![wr.gen_success(&format!("dn: {}", self.bound_dn))]),
            };

            let replies = match replies {
                Ok(replies) => replies,
                Err(fault) => break Exit::Fault(fault),
            };

            match self.write(&mut resp, replies).await {
                Ok(true) => {}
                Ok(false) => break Exit::Deadline,
                Err(()) => break Exit::WriteFailed,
            }
        };

        self.finish(exit).await
    }

    async fn write<S>(&self, resp: &mut S, replies: Vec<LdapMsg>) -> Result<bool, ()>
    where
        S: futures::Sink<LdapMsg> + Unpin,
    {
        for reply in replies {
            match self.handle.bounded(resp.feed(reply)).await {
                Err(_) => return Ok(false),
                Ok(Err(_)) => return Err(()),
                Ok(Ok(())) => {}
            }
        }
        match self.handle.bounded(resp.flush()).await {
            Err(_) => Ok(false),
            Ok(Err(_)) => Err(()),
            Ok(Ok(())) => Ok(true),
        }
    }

    async fn bind(&mut self, sbr: &SimpleBindRequest) -> Result<Vec<LdapMsg>, ProxyError> {
        match self.handler.bind(&sbr.dn, &sbr.pw, &self.handle).await {
            Ok(()) => {
                metrics::record_bind(ResultCode::Success);
                self.bound_dn = sbr.dn.clone();
                Ok(vec![sbr.gen_success()])
            }
            Err(e) if e.is_internal_fault() => Err(e),
            Err(e) => {
                // A failed bind leaves the connection anonymous
                self.bound_dn.clear();
                let code = e.result_code();
                metrics::record_bind(code);
                info!("Bind for {:?} from {}: {}", sbr.dn, self.handle.peer, e);
                Ok(vec![sbr.gen_error(wire_code(code), e.to_string())])
            }
        }
    }

    async fn search(&mut self, sr: &WireSearchRequest) -> Result<Vec<LdapMsg>, ProxyError> {
        let request = search_request(sr);

        match self.handler.search(&self.bound_dn, &request, &self.handle).await {
            Ok(outcome) => {
                metrics::record_search(outcome.code, outcome.entries.len());
                let mut replies: Vec<LdapMsg> = outcome
                    .entries
                    .into_iter()
                    .map(|entry| sr.gen_result_entry(wire_entry(entry)))
                    .collect();
                replies.push(if outcome.code.is_success() {
                    sr.gen_success()
                } else {
                    sr.gen_error(wire_code(outcome.code), String::new())
                });
                Ok(replies)
            }
            Err(e) if e.is_internal_fault() => Err(e),
            Err(e) => {
                let code = e.result_code();
                metrics::record_search(code, 0);
                info!(
                    "Search {} under {:?} from {}: {}",
                    request.filter, request.base_dn, self.handle.peer, e
                );
                Ok(vec![sr.gen_error(wire_code(code), e.to_string())])
            }
        }
    }

    async fn finish(self, exit: Exit) -> Result<(), ProxyError> {
        let peer = self.handle.peer;
        let mut result = Ok(());

        match exit {
            Exit::Eof | Exit::Unbind | Exit::Closed => debug!("Client {} disconnected", peer),
            Exit::Shutdown => debug!("Closing client {} for shutdown", peer),
            Exit::Deadline => {
                metrics::record_deadline_expired();
                info!("Client {} exceeded its operation deadline", peer);
            }
            Exit::Protocol => warn!("Client {} sent an unsupported request", peer),
            Exit::WriteFailed => debug!("Write to client {} failed", peer),
            Exit::Fault(fault) => match self.fault_policy {
                FaultPolicy::Isolate => {
                    warn!("Closing client {} after internal fault: {}", peer, fault);
                }
                FaultPolicy::Halt => {
                    error!("Internal fault serving {}, halting: {}", peer, fault);
                    result = Err(fault);
                }
            },
        }

        if let Err(e) = self.handler.close(&self.handle).await {
            warn!("Close for {} failed: {}", peer, e);
        }
        result
    }
}

fn search_request(sr: &WireSearchRequest) -> SearchRequest {
    let scope = match sr.scope {
        LdapSearchScope::Base => SearchScope::BaseObject,
        LdapSearchScope::OneLevel => SearchScope::SingleLevel,
        LdapSearchScope::Subtree | LdapSearchScope::Children => SearchScope::WholeSubtree,
    };

    SearchRequest::new(sr.base.clone(), filter::render(&sr.filter), sr.attrs.clone())
        .with_scope(scope)
}

fn wire_entry(entry: Entry) -> LdapSearchResultEntry {
    LdapSearchResultEntry {
        dn: entry.dn,
        attributes: entry
            .attributes
            .into_iter()
            .map(|a| LdapPartialAttribute {
                atype: a.name,
                vals: a.values,
            })
            .collect(),
    }
}

fn wire_code(code: ResultCode) -> LdapResultCode {
    match code {
        ResultCode::Success => LdapResultCode::Success,
        ResultCode::OperationsError => LdapResultCode::OperationsError,
        ResultCode::ProtocolError => LdapResultCode::ProtocolError,
        ResultCode::TimeLimitExceeded => LdapResultCode::TimeLimitExceeded,
        ResultCode::SizeLimitExceeded => LdapResultCode::SizeLimitExceeded,
        ResultCode::NoSuchObject => LdapResultCode::NoSuchObject,
        ResultCode::InvalidCredentials => LdapResultCode::InvalidCredentials,
        ResultCode::InsufficientAccessRights => LdapResultCode::InsufficentAccessRights,
        ResultCode::Busy => LdapResultCode::Busy,
        ResultCode::Unavailable => LdapResultCode::Unavailable,
        ResultCode::UnwillingToPerform => LdapResultCode::UnwillingToPerform,
        ResultCode::Other => LdapResultCode::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3_proto::parse_ldap_filter_str;
    use ldap_proxy_core::types::Attribute;
    use std::time::Duration;

    fn handle() -> ClientHandle {
        ClientHandle::new(
            "127.0.0.1:389".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_no_deadline_before_first_operation() {
        let handle = handle();
        assert!(handle.deadline().is_none());
        assert_eq!(handle.bounded(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_io() {
        let handle = handle();
        handle.set_deadline(std::time::Instant::now() + Duration::from_millis(10));

        let result = handle
            .bounded(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rearmed_deadline_replaces_previous() {
        let handle = handle();
        handle.set_deadline(std::time::Instant::now());
        handle.set_deadline(std::time::Instant::now() + Duration::from_secs(30));

        let result = handle
            .bounded(tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_close_cancels() {
        let handle = handle();
        assert!(!handle.is_closed());
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(handle.peer_addr(), "127.0.0.1:50000");
        assert_eq!(handle.local_addr(), "127.0.0.1:389");
    }

    #[test]
    fn test_search_request_conversion() {
        let wire = WireSearchRequest {
            msgid: 2,
            base: "dc=example,dc=com".to_string(),
            scope: LdapSearchScope::OneLevel,
            filter: parse_ldap_filter_str("(&(objectClass=person)(uid=jdoe))").unwrap(),
            attrs: vec!["cn".to_string()],
        };

        let request = search_request(&wire);
        assert_eq!(request.base_dn, "dc=example,dc=com");
        assert_eq!(request.scope, SearchScope::SingleLevel);
        assert_eq!(request.filter, "(&(objectClass=person)(uid=jdoe))");
        assert_eq!(request.attributes, vec!["cn".to_string()]);
    }

    #[test]
    fn test_entry_and_code_conversion() {
        let entry = Entry::new(
            "uid=jdoe,dc=example,dc=com",
            vec![Attribute::text("cn", ["John Doe"])],
        );
        let wire = wire_entry(entry);
        assert_eq!(wire.dn, "uid=jdoe,dc=example,dc=com");
        assert_eq!(wire.attributes[0].atype, "cn");
        assert_eq!(wire.attributes[0].vals, vec![b"John Doe".to_vec()]);

        assert_eq!(
            wire_code(ResultCode::InvalidCredentials) as i64,
            49
        );
        assert_eq!(wire_code(ResultCode::OperationsError) as i64, 1);
        assert_eq!(wire_code(ResultCode::Other) as i64, 80);
    }
}
