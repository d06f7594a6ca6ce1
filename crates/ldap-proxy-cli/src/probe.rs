//! `probe` command: bind and search an LDAP server directly

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Args;
use ldap_proxy_backend::{BackendConnection, BackendConnector, LdapConnector};
use ldap_proxy_core::types::{Entry, SearchRequest};
use ldap_proxy_core::{ProxyConfig, DEFAULT_PAGE_SIZE};
use std::fmt::Write;
use tracing::info;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Directory host (defaults to the configured upstream)
    #[arg(long)]
    host: Option<String>,

    /// Directory port (defaults to the configured upstream)
    #[arg(long)]
    port: Option<u16>,

    /// DN to bind as; the search runs anonymously when omitted
    #[arg(short = 'D', long)]
    bind_dn: Option<String>,

    /// Bind password
    #[arg(short = 'w', long, env = "LDAP_PROXY_PROBE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Search base DN
    #[arg(short, long)]
    base: String,

    /// Search filter
    #[arg(short, long, default_value = "(objectClass=*)")]
    filter: String,

    /// Attribute to return (repeatable; all user attributes when omitted)
    #[arg(short, long = "attr")]
    attrs: Vec<String>,

    /// Entries per page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: i32,
}

pub async fn run(config: &ProxyConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let mut upstream = config.upstream.clone();
    if let Some(host) = args.host {
        upstream.host = host;
    }
    if let Some(port) = args.port {
        upstream.port = port;
    }

    let connector = LdapConnector::new(upstream);
    let conn = connector
        .dial()
        .await
        .with_context(|| format!("Cannot connect to {}", connector.endpoint()))?;

    if let Some(dn) = &args.bind_dn {
        conn.simple_bind(dn, args.password.as_deref().unwrap_or_default())
            .await
            .with_context(|| format!("Cannot bind as {}", dn))?;
    }

    // Unlimited subtree search, aliases never dereferenced
    let request = SearchRequest::new(args.base, args.filter, args.attrs);
    let entries = conn
        .paged_search(&request, args.page_size)
        .await
        .context("Search failed")?;

    info!(
        "Search: {} -> num of entries = {}",
        request.filter,
        entries.len()
    );
    for entry in &entries {
        print!("{}", to_ldif(entry));
    }

    conn.close().await.ok();
    Ok(())
}

/// LDIF-style rendering; values that are not printable text are base64 encoded
fn to_ldif(entry: &Entry) -> String {
    let mut out = format!("dn: {}\n", entry.dn);
    for attr in &entry.attributes {
        for value in &attr.values {
            match std::str::from_utf8(value) {
                Ok(text) if is_safe_string(text) => {
                    let _ = writeln!(out, "{}: {}", attr.name, text);
                }
                _ => {
                    let _ = writeln!(out, "{}:: {}", attr.name, STANDARD.encode(value));
                }
            }
        }
    }
    out.push('\n');
    out
}

// RFC 2849 SAFE-STRING
fn is_safe_string(s: &str) -> bool {
    let starts_ok = !matches!(s.chars().next(), Some(' ' | ':' | '<'));
    starts_ok
        && !s.ends_with(' ')
        && s.chars().all(|c| c.is_ascii() && c != '\0' && c != '\n' && c != '\r')
}
