//! LDAP value types
//!
//! Protocol-neutral representations of the requests and results that flow
//! between the listener, the session handlers and the upstream connector.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Result codes
// ============================================================================

/// LDAPv3 result code (RFC 4511, section 4.1.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    NoSuchObject,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    Other,
}

impl ResultCode {
    /// Numeric value on the wire
    pub fn code(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::Other => 80,
        }
    }

    /// Map a numeric result code; codes the proxy does not model become `Other`
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            32 => ResultCode::NoSuchObject,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            _ => ResultCode::Other,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::Other => "other",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

// ============================================================================
// Search parameters
// ============================================================================

/// Search scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    #[default]
    WholeSubtree,
}

/// Alias dereferencing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DerefAliases {
    #[default]
    Never,
    InSearching,
    FindingBaseObject,
    Always,
}

/// A search request as seen by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Base DN of the search
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    /// Maximum number of entries, 0 = no limit
    pub size_limit: i32,
    /// Time limit in seconds, 0 = no limit
    pub time_limit: i32,
    pub types_only: bool,
    /// Filter in RFC 4515 string form
    pub filter: String,
    /// Requested attributes (empty = all user attributes)
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Subtree search with no limits
    pub fn new(
        base_dn: impl Into<String>,
        filter: impl Into<String>,
        attributes: Vec<String>,
    ) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.into(),
            attributes,
        }
    }

    pub fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_deref(mut self, deref_aliases: DerefAliases) -> Self {
        self.deref_aliases = deref_aliases;
        self
    }

    pub fn with_limits(mut self, size_limit: i32, time_limit: i32) -> Self {
        self.size_limit = size_limit;
        self.time_limit = time_limit;
        self
    }
}

// ============================================================================
// Search results
// ============================================================================

/// One attribute of a directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Build an attribute from textual values
    pub fn text<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values
                .into_iter()
                .map(|v| v.into().into_bytes())
                .collect(),
        }
    }
}

/// A directory entry returned by a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry DN (Distinguished Name)
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    /// Get first value of an attribute as text (attribute names are case-insensitive)
    pub fn first_value(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .and_then(|a| a.values.first())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

/// An LDAP control attached to a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

/// Outcome of a proxied search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub code: ResultCode,
    pub entries: Vec<Entry>,
    pub referrals: Vec<String>,
    pub controls: Vec<Control>,
}

impl SearchOutcome {
    pub fn success(entries: Vec<Entry>) -> Self {
        Self {
            code: ResultCode::Success,
            entries,
            referrals: Vec::new(),
            controls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResultCode::from_code(0), ResultCode::Success);
        assert_eq!(ResultCode::from_code(49), ResultCode::InvalidCredentials);
        assert_eq!(ResultCode::InvalidCredentials.code(), 49);
        assert_eq!(ResultCode::OperationsError.code(), 1);

        // Codes the proxy does not model collapse to other
        assert_eq!(ResultCode::from_code(68), ResultCode::Other);
        assert_eq!(ResultCode::from_code(9999), ResultCode::Other);
    }

    #[test]
    fn test_result_code_display() {
        assert_eq!(
            ResultCode::InvalidCredentials.to_string(),
            "invalidCredentials (49)"
        );
    }

    #[test]
    fn test_entry_first_value() {
        let entry = Entry::new(
            "uid=jdoe,ou=users,dc=example,dc=com",
            vec![
                Attribute::text("uid", ["jdoe"]),
                Attribute::text("mail", ["jdoe@example.com", "john@example.com"]),
            ],
        );

        assert_eq!(entry.first_value("MAIL").as_deref(), Some("jdoe@example.com"));
        assert_eq!(entry.first_value("cn"), None);
    }

    #[test]
    fn test_search_request_builder() {
        let req = SearchRequest::new("dc=example,dc=com", "(objectClass=*)", vec![])
            .with_scope(SearchScope::BaseObject)
            .with_limits(5, 2);

        assert_eq!(req.scope, SearchScope::BaseObject);
        assert_eq!(req.size_limit, 5);
        assert_eq!(req.time_limit, 2);
        assert_eq!(req.deref_aliases, DerefAliases::Never);
    }
}
