//! `ldap3` implementation of the connector
//!
//! Supports plain LDAP and STARTTLS upgrades, per-operation timeouts and
//! paged subtree searches.

mod client;

pub use client::{LdapConnection, LdapConnector};
