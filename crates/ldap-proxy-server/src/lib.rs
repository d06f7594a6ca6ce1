//! ldap-proxy Server
//!
//! Accepts LDAP clients, decodes their requests with `ldap3_proto` and
//! drives a [`DirectoryHandler`](ldap_proxy_session::DirectoryHandler) for
//! every Bind, Search and Unbind. Optionally serves `/metrics` and `/health`
//! over HTTP.

pub mod admin;
mod connection;
pub mod filter;
mod listener;
pub mod metrics;
mod server;

pub use listener::{Listener, ListenerStats};
pub use server::ProxyServer;
