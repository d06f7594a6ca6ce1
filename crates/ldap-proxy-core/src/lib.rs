//! ldap-proxy Core Library
//!
//! Configuration, error types and the LDAP value types shared by the
//! backend connector, the session layer and the listener.

pub mod config;
pub mod error;
pub mod types;

pub use config::ProxyConfig;
pub use error::{BackendError, ProxyError, Result};

/// ldap-proxy version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Program name used in banners and log lines
pub const PROGRAM_NAME: &str = "ldap-proxy";

/// Default LDAP port
pub const DEFAULT_LDAP_PORT: u16 = 389;

/// Deadline applied to the client socket at the start of every operation (seconds)
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 10;

/// Upper bound accepted for client and upstream timeouts (one day)
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Entries requested per page from the upstream server
pub const DEFAULT_PAGE_SIZE: i32 = 64;

/// Size limit sent upstream with every search
pub const DEFAULT_SIZE_LIMIT: i32 = 64;

/// Time limit sent upstream with every search (seconds)
pub const DEFAULT_TIME_LIMIT_SECS: i32 = 10;
