//! LDAP client connector
//!
//! Opens one `ldap3` connection per call to [`LdapConnector::connect`] and
//! forwards binds and paged searches over it.

use async_trait::async_trait;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{
    DerefAliases as LdapDeref, Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult,
    Scope, SearchEntry, SearchOptions,
};
use ldap_proxy_core::config::UpstreamConfig;
use ldap_proxy_core::types::{Attribute, DerefAliases, Entry, ResultCode, SearchRequest, SearchScope};
use ldap_proxy_core::BackendError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::traits::{BackendConnection, BackendConnector};

/// How long `close` waits for the connection driver to finish after unbind
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Connector dialing the configured upstream with `ldap3`
#[derive(Debug, Clone)]
pub struct LdapConnector {
    config: UpstreamConfig,
}

impl LdapConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Open a connection without going through the trait object
    pub async fn dial(&self) -> Result<LdapConnection, BackendError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.config.connect_timeout())
            .set_starttls(self.config.starttls);

        let url = self.config.url();
        debug!("Connecting to upstream LDAP server: {}", url);

        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| BackendError::Connect {
                addr: self.config.addr(),
                source: Box::new(e),
            })?;

        let addr = self.config.addr();
        let driver_addr = addr.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!("Upstream connection to {} ended with error: {}", driver_addr, e);
            }
        });

        Ok(LdapConnection {
            ldap,
            addr,
            operation_timeout: self.config.operation_timeout(),
            driver: Mutex::new(Some(driver)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BackendConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        let conn = self.dial().await?;
        Ok(Box::new(conn))
    }

    fn endpoint(&self) -> String {
        self.config.addr()
    }
}

/// A dedicated upstream connection
pub struct LdapConnection {
    ldap: Ldap,
    addr: String,
    operation_timeout: Option<Duration>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LdapConnection {
    /// Handle for the next operation, carrying the per-operation timeout
    fn handle(&self) -> Result<Ldap, BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }

        let mut ldap = self.ldap.clone();
        if let Some(timeout) = self.operation_timeout {
            ldap.with_timeout(timeout);
        }
        Ok(ldap)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl BackendConnection for LdapConnection {
    async fn simple_bind(&self, dn: &str, password: &str) -> Result<(), BackendError> {
        let mut ldap = self.handle()?;

        let result = ldap
            .simple_bind(dn, password)
            .await
            .map_err(map_ldap_error)?;

        check_result(result)
    }

    async fn paged_search(
        &self,
        request: &SearchRequest,
        page_size: i32,
    ) -> Result<Vec<Entry>, BackendError> {
        let mut ldap = self.handle()?;
        ldap.with_search_options(
            SearchOptions::new()
                .deref(deref_to_ldap(request.deref_aliases))
                .sizelimit(request.size_limit)
                .timelimit(request.time_limit)
                .typesonly(request.types_only),
        );

        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(page_size)),
        ];
        let attrs: Vec<&str> = request.attributes.iter().map(String::as_str).collect();

        let mut stream = ldap
            .streaming_search_with(
                adapters,
                &request.base_dn,
                scope_to_ldap(request.scope),
                &request.filter,
                attrs,
            )
            .await
            .map_err(map_ldap_error)?;

        let mut entries = Vec::new();
        while let Some(raw) = stream.next().await.map_err(map_ldap_error)? {
            entries.push(entry_from_ldap(SearchEntry::construct(raw)));
        }

        check_result(stream.finish().await)?;

        debug!(
            "Upstream search OK: {} -> num of entries = {}",
            request.filter,
            entries.len()
        );
        Ok(entries)
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut ldap = self.ldap.clone();
        let unbind = ldap.unbind().await.map_err(map_ldap_error);

        let driver = self.driver.lock().take();
        if let Some(mut handle) = driver {
            if tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        debug!("Closed upstream connection to {}", self.addr);
        unbind
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

fn check_result(result: LdapResult) -> Result<(), BackendError> {
    if result.rc == 0 {
        return Ok(());
    }

    Err(BackendError::Result {
        code: ResultCode::from_code(result.rc),
        message: result.text,
    })
}

fn map_ldap_error(err: LdapError) -> BackendError {
    match err {
        LdapError::Timeout { .. } => BackendError::Timeout,
        other => BackendError::protocol(other),
    }
}

fn scope_to_ldap(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::BaseObject => Scope::Base,
        SearchScope::SingleLevel => Scope::OneLevel,
        SearchScope::WholeSubtree => Scope::Subtree,
    }
}

fn deref_to_ldap(deref: DerefAliases) -> LdapDeref {
    match deref {
        DerefAliases::Never => LdapDeref::Never,
        DerefAliases::InSearching => LdapDeref::Searching,
        DerefAliases::FindingBaseObject => LdapDeref::Finding,
        DerefAliases::Always => LdapDeref::Always,
    }
}

/// Convert a decoded `ldap3` entry; attributes are sorted by name
fn entry_from_ldap(entry: SearchEntry) -> Entry {
    let mut attributes: Vec<Attribute> = entry
        .attrs
        .into_iter()
        .map(|(name, values)| Attribute::text(name, values))
        .chain(
            entry
                .bin_attrs
                .into_iter()
                .map(|(name, values)| Attribute::new(name, values)),
        )
        .collect();
    attributes.sort_by(|a, b| a.name.cmp(&b.name));

    Entry::new(entry.dn, attributes)
}
