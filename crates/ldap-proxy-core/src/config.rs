//! Configuration for ldap-proxy
//!
//! The configuration is built once at startup (defaults, then a TOML file or
//! the environment, then command line overrides) and handed by value to the
//! components that need it. Nothing re-reads the environment afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{ProxyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl ProxyConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Build a configuration from the process environment.
    ///
    /// Recognised variables:
    /// `APP_IP`, `APP_PORT`, `TARGET_LDAP_SERVER`, `TARGET_LDAP_PORT`, `TZ`,
    /// `APP_DEBUG`, plus `LDAP_PROXY_*` for the remaining settings.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_lookup(lookup)?;
        Ok(config)
    }

    /// Overlay environment-style variables on top of this configuration
    pub fn apply_lookup<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(ip) = var("APP_IP") {
            self.server.bind_address = ip;
        }
        if let Some(port) = var("APP_PORT") {
            self.server.port = parse_var("APP_PORT", &port)?;
        }
        if let Some(max) = var("LDAP_PROXY_MAX_CONNECTIONS") {
            self.server.max_connections = parse_var("LDAP_PROXY_MAX_CONNECTIONS", &max)?;
        }

        if let Some(host) = var("TARGET_LDAP_SERVER") {
            self.upstream.host = host;
        }
        if let Some(port) = var("TARGET_LDAP_PORT") {
            self.upstream.port = parse_var("TARGET_LDAP_PORT", &port)?;
        }
        if let Some(secs) = var("LDAP_PROXY_CONNECT_TIMEOUT") {
            self.upstream.connect_timeout_secs = parse_var("LDAP_PROXY_CONNECT_TIMEOUT", &secs)?;
        }
        if let Some(secs) = var("LDAP_PROXY_OPERATION_TIMEOUT") {
            self.upstream.operation_timeout_secs =
                parse_var("LDAP_PROXY_OPERATION_TIMEOUT", &secs)?;
        }
        if let Some(flag) = var("LDAP_PROXY_STARTTLS") {
            self.upstream.starttls = is_truthy(&flag);
        }

        if let Some(secs) = var("LDAP_PROXY_CLIENT_TIMEOUT") {
            self.session.client_timeout_secs = parse_var("LDAP_PROXY_CLIENT_TIMEOUT", &secs)?;
        }
        if let Some(policy) = var("LDAP_PROXY_FAULT_POLICY") {
            self.session.fault_policy = FaultPolicy::parse(&policy)?;
        }

        if let Some(tz) = var("TZ") {
            self.logging.timezone = Some(tz);
        }
        if let Some(flag) = var("APP_DEBUG") {
            self.logging.debug = is_truthy(&flag);
        }
        if let Some(level) = var("LDAP_PROXY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("LDAP_PROXY_LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&format)?;
        }

        if let Some(port) = var("LDAP_PROXY_METRICS_PORT") {
            self.metrics.enabled = true;
            self.metrics.port = parse_var("LDAP_PROXY_METRICS_PORT", &port)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(ProxyError::Config("Listen port must not be 0".into()));
        }
        if self.upstream.host.trim().is_empty() {
            return Err(ProxyError::Config("Upstream host is required".into()));
        }
        if self.upstream.port == 0 {
            return Err(ProxyError::Config("Upstream port must not be 0".into()));
        }
        if self.session.page_size <= 0 {
            return Err(ProxyError::Config("Page size must be positive".into()));
        }
        if self.session.client_timeout_secs == 0 {
            return Err(ProxyError::Config("Client timeout must not be 0".into()));
        }
        if self.session.client_timeout_secs > crate::MAX_TIMEOUT_SECS {
            return Err(ProxyError::Config(format!(
                "Client timeout must not exceed {}s",
                crate::MAX_TIMEOUT_SECS
            )));
        }
        if self.upstream.operation_timeout_secs > crate::MAX_TIMEOUT_SECS
            || self.upstream.connect_timeout_secs > crate::MAX_TIMEOUT_SECS
        {
            return Err(ProxyError::Config(format!(
                "Upstream timeouts must not exceed {}s",
                crate::MAX_TIMEOUT_SECS
            )));
        }
        if let Some(tz) = &self.logging.timezone {
            validate_timezone(tz)?;
        }
        Ok(())
    }

    /// Address the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Maximum concurrent client connections (0 = unlimited)
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: crate::DEFAULT_LDAP_PORT,
            max_connections: 0,
        }
    }
}

/// Upstream directory server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    /// TCP connect + handshake timeout in seconds
    pub connect_timeout_secs: u64,
    /// Timeout for each forwarded operation in seconds (0 = none)
    pub operation_timeout_secs: u64,
    /// Upgrade the upstream connection with StartTLS
    pub starttls: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: crate::DEFAULT_LDAP_PORT,
            connect_timeout_secs: 10,
            operation_timeout_secs: 10,
            starttls: false,
        }
    }
}

impl UpstreamConfig {
    /// `ldap://host:port` URL understood by the directory client
    pub fn url(&self) -> String {
        format!("ldap://{}:{}", self.host, self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_secs > 0).then(|| Duration::from_secs(self.operation_timeout_secs))
    }
}

/// Per-session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline applied to the client socket at the start of each operation
    pub client_timeout_secs: u64,
    /// Entries per page requested upstream
    pub page_size: i32,
    /// Size limit sent upstream
    pub size_limit: i32,
    /// Time limit sent upstream (seconds)
    pub time_limit_secs: i32,
    pub fault_policy: FaultPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_timeout_secs: crate::DEFAULT_CLIENT_TIMEOUT_SECS,
            page_size: crate::DEFAULT_PAGE_SIZE,
            size_limit: crate::DEFAULT_SIZE_LIMIT,
            time_limit_secs: crate::DEFAULT_TIME_LIMIT_SECS,
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// What the dispatcher does when a handler reports an internal fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Close only the offending client connection and its session
    #[default]
    Isolate,
    /// Stop the whole service
    Halt,
}

impl FaultPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "isolate" => Ok(FaultPolicy::Isolate),
            "halt" => Ok(FaultPolicy::Halt),
            other => Err(ProxyError::Config(format!(
                "Unknown fault policy '{}' (expected isolate or halt)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Force debug level regardless of `level`
    pub debug: bool,
    /// IANA timezone used for log timestamps
    pub timezone: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            debug: false,
            timezone: None,
        }
    }
}

impl LoggingConfig {
    /// Level directive handed to the subscriber
    pub fn effective_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.level
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ProxyError::Config(format!("Unknown log format '{}'", other))),
        }
    }
}

/// Prometheus metrics / health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1".to_string(),
            port: 9389,
        }
    }
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

const ZONEINFO_DIRS: &[&str] = &[
    "/usr/share/zoneinfo",
    "/usr/lib/zoneinfo",
    "/usr/share/lib/zoneinfo",
];

/// Check that a timezone name resolves to a zoneinfo file
pub fn validate_timezone(name: &str) -> Result<()> {
    let name = name.trim().trim_start_matches(':');
    if name.is_empty() || name.eq_ignore_ascii_case("UTC") || name == "Local" {
        return Ok(());
    }

    if name.contains("..") {
        return Err(ProxyError::Config(format!("Invalid timezone '{}'", name)));
    }

    let found = if Path::new(name).is_absolute() {
        Path::new(name).is_file()
    } else {
        let tzdir = std::env::var("TZDIR").ok();
        tzdir
            .iter()
            .map(String::as_str)
            .chain(ZONEINFO_DIRS.iter().copied())
            .any(|dir| Path::new(dir).join(name).is_file())
    };

    if found {
        Ok(())
    } else {
        Err(ProxyError::Config(format!(
            "Unable to load timezone '{}'",
            name
        )))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Config(format!("Invalid value for {}: '{}'", key, value)))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
