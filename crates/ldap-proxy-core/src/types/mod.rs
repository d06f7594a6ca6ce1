//! Shared types

mod ldap;

pub use ldap::*;
