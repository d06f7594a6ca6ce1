//! Search filter rendering
//!
//! The listener receives filters already decoded from BER. The upstream
//! client takes the RFC 4515 string form, so the decoded tree is written
//! back out with assertion values escaped.

use ldap3::ldap_escape;
use ldap3_proto::proto::{LdapMatchingRuleAssertion, LdapSubstringFilter};
use ldap3_proto::LdapFilter;
use std::fmt::Write;

/// Render a decoded filter in its string representation
pub fn render(filter: &LdapFilter) -> String {
    let mut out = String::new();
    write_filter(&mut out, filter);
    out
}

fn write_filter(out: &mut String, filter: &LdapFilter) {
    out.push('(');
    match filter {
        LdapFilter::And(items) => {
            out.push('&');
            items.iter().for_each(|f| write_filter(out, f));
        }
        LdapFilter::Or(items) => {
            out.push('|');
            items.iter().for_each(|f| write_filter(out, f));
        }
        LdapFilter::Not(inner) => {
            out.push('!');
            write_filter(out, inner);
        }
        LdapFilter::Equality(attr, value) => write_assertion(out, attr, "=", value),
        LdapFilter::GreaterOrEqual(attr, value) => write_assertion(out, attr, ">=", value),
        LdapFilter::LessOrEqual(attr, value) => write_assertion(out, attr, "<=", value),
        LdapFilter::Approx(attr, value) => write_assertion(out, attr, "~=", value),
        LdapFilter::Present(attr) => {
            let _ = write!(out, "{}=*", attr);
        }
        LdapFilter::Substring(attr, substrings) => write_substring(out, attr, substrings),
        LdapFilter::Extensible(assertion) => write_extensible(out, assertion),
    }
    out.push(')');
}

fn write_assertion(out: &mut String, attr: &str, op: &str, value: &str) {
    let _ = write!(out, "{}{}{}", attr, op, ldap_escape(value));
}

fn write_substring(out: &mut String, attr: &str, substrings: &LdapSubstringFilter) {
    out.push_str(attr);
    out.push('=');
    if let Some(initial) = &substrings.initial {
        out.push_str(&ldap_escape(initial.as_str()));
    }
    out.push('*');
    for any in &substrings.any {
        out.push_str(&ldap_escape(any.as_str()));
        out.push('*');
    }
    if let Some(final_) = &substrings.final_ {
        out.push_str(&ldap_escape(final_.as_str()));
    }
}

// attr [":dn"] [":" rule] ":=" value
fn write_extensible(out: &mut String, assertion: &LdapMatchingRuleAssertion) {
    if let Some(type_) = &assertion.type_ {
        out.push_str(type_);
    }
    if assertion.dn_attributes {
        out.push_str(":dn");
    }
    if let Some(rule) = &assertion.matching_rule {
        out.push(':');
        out.push_str(rule);
    }
    out.push_str(":=");
    out.push_str(&ldap_escape(assertion.match_value.as_str()));
}
