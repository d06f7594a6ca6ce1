//! Upstream directory connector for ldap-proxy
//!
//! Every client session owns exactly one upstream connection, opened lazily
//! through a [`BackendConnector`] and used for the lifetime of the session.
//! There is no pooling, no retry and no reconnect.

pub mod ldap;
mod traits;

pub use ldap::{LdapConnection, LdapConnector};
pub use traits::{BackendConnection, BackendConnector};
