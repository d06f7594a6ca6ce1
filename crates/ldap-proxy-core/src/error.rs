//! Error types for ldap-proxy

use crate::types::ResultCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Boxed cause carried through from the directory client library
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by an upstream directory connection
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: BoxError,
    },

    #[error("Upstream returned {code}: {message}")]
    Result { code: ResultCode, message: String },

    #[error("Upstream operation timed out")]
    Timeout,

    #[error("Upstream connection is closed")]
    Closed,

    #[error("Upstream protocol error: {0}")]
    Protocol(#[source] BoxError),
}

impl BackendError {
    /// Result code reported by the upstream server, if the failure carried one
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            BackendError::Result { code, .. } => Some(*code),
            BackendError::Timeout => Some(ResultCode::TimeLimitExceeded),
            _ => None,
        }
    }

    pub fn protocol(err: impl Into<BoxError>) -> Self {
        BackendError::Protocol(err.into())
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Upstream unreachable while acquiring a session
    #[error("Cannot reach upstream directory: {0}")]
    Connect(#[source] BackendError),

    /// Upstream rejected the forwarded bind
    #[error("Upstream rejected bind: {0}")]
    Auth(#[source] BackendError),

    /// Paged search failed upstream
    #[error("Upstream search failed: {0}")]
    Search(#[source] BackendError),

    /// A handler panicked; reported to the supervising layer
    #[error("Internal fault: {0}")]
    InternalFault(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Protocol result code sent to the client for this error
    pub fn result_code(&self) -> ResultCode {
        match self {
            ProxyError::Connect(_) => ResultCode::OperationsError,
            ProxyError::Auth(_) => ResultCode::InvalidCredentials,
            ProxyError::Search(e) => e.result_code().unwrap_or(ResultCode::Other),
            ProxyError::InternalFault(_) => ResultCode::Other,
            ProxyError::Config(_) => ResultCode::OperationsError,
            ProxyError::Io(_) => ResultCode::Other,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Connect(_) => "connect",
            ProxyError::Auth(_) => "auth",
            ProxyError::Search(_) => "search",
            ProxyError::InternalFault(_) => "internal_fault",
            ProxyError::Config(_) => "config",
            ProxyError::Io(_) => "io",
        }
    }

    pub fn is_internal_fault(&self) -> bool {
        matches!(self, ProxyError::InternalFault(_))
    }
}
