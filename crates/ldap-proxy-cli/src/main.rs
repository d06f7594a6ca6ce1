//! ldap-proxy - LDAP Bind/Search Proxy
//!
//! Forwards client binds and searches to an upstream directory server over
//! one dedicated upstream connection per client.

mod logging;
mod probe;

use clap::{Parser, Subcommand};
use ldap_proxy_core::config::{FaultPolicy, LogFormat};
use ldap_proxy_core::ProxyConfig;
use ldap_proxy_server::ProxyServer;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "ldap-proxy")]
#[command(version = ldap_proxy_core::VERSION)]
#[command(about = "LDAP bind/search proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LDAP_PROXY_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(long, env = "APP_IP")]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long, env = "APP_PORT")]
    port: Option<u16>,

    /// Upstream LDAP server host
    #[arg(long, env = "TARGET_LDAP_SERVER", global = true)]
    upstream_host: Option<String>,

    /// Upstream LDAP server port
    #[arg(long, env = "TARGET_LDAP_PORT", global = true)]
    upstream_port: Option<u16>,

    /// Maximum concurrent client connections (0 = unlimited)
    #[arg(long, env = "LDAP_PROXY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// What to do when a handler faults (isolate, halt)
    #[arg(long, env = "LDAP_PROXY_FAULT_POLICY", value_parser = parse_fault_policy)]
    fault_policy: Option<FaultPolicy>,

    /// Serve /metrics and /health on this port
    #[arg(long, env = "LDAP_PROXY_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Timezone for log timestamps (IANA name)
    #[arg(long, env = "TZ", global = true)]
    timezone: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LDAP_PROXY_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, env = "LDAP_PROXY_LOG_FORMAT", global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Enable debug logging
    #[arg(
        long,
        env = "APP_DEBUG",
        global = true,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy (default)
    Serve,

    /// Bind and search an LDAP server directly
    Probe(probe::ProbeArgs),

    /// Show version information
    Version,
}

fn parse_fault_policy(value: &str) -> Result<FaultPolicy, String> {
    FaultPolicy::parse(value).map_err(|e| e.to_string())
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    LogFormat::parse(value).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if matches!(cli.command, Some(Commands::Version)) {
        print_banner();
        return Ok(());
    }

    let config = load_config(&cli)?;
    logging::init(&config.logging)?;
    debug!("Effective configuration: {:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Some(Commands::Probe(args)) => runtime.block_on(probe::run(&config, args)),
        _ => {
            print_banner();
            runtime.block_on(run_server(config))
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ProxyConfig> {
    let mut config = if let Some(config_path) = &cli.config {
        ProxyConfig::from_file(config_path)?
    } else {
        ProxyConfig::from_env()?
    };

    // Override with CLI args
    if let Some(bind) = &cli.bind {
        config.server.bind_address = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(max) = cli.max_connections {
        config.server.max_connections = max;
    }
    if let Some(host) = &cli.upstream_host {
        config.upstream.host = host.clone();
    }
    if let Some(port) = cli.upstream_port {
        config.upstream.port = port;
    }
    if let Some(policy) = cli.fault_policy {
        config.session.fault_policy = policy;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }
    if let Some(tz) = &cli.timezone {
        config.logging.timezone = Some(tz.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if cli.debug {
        config.logging.debug = true;
    }

    config.validate()?;
    Ok(config)
}

fn print_banner() {
    println!(
        r#"
    _     _
   | | __| | __ _ _ __        _ __  _ __ _____  ___   _
   | |/ _` |/ _` | '_ \ _____| '_ \| '__/ _ \ \/ / | | |
   | | (_| | (_| | |_) |_____| |_) | | | (_) >  <| |_| |
   |_|\__,_|\__,_| .__/      | .__/|_|  \___/_/\_\\__, |
                 |_|         |_|                  |___/

   LDAP Bind/Search Proxy
   Version: {}
"#,
        ldap_proxy_core::VERSION
    );
}

async fn run_server(config: ProxyConfig) -> anyhow::Result<()> {
    info!("Starting ldap-proxy...");
    info!(
        "Listening on {}, forwarding to {}",
        config.listen_addr(),
        config.upstream.addr()
    );

    let server = ProxyServer::new(config);
    server.run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "ldap-proxy",
            "--bind",
            "127.0.0.1",
            "--port",
            "10389",
            "--upstream-host",
            "dc1.example.com",
            "--upstream-port",
            "3268",
            "--fault-policy",
            "halt",
            "--timezone",
            "UTC",
            "serve",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:10389");
        assert_eq!(config.upstream.addr(), "dc1.example.com:3268");
        assert_eq!(config.session.fault_policy, FaultPolicy::Halt);
        assert_eq!(config.logging.timezone.as_deref(), Some("UTC"));
    }

    #[test]
    fn test_probe_arguments() {
        let cli = Cli::try_parse_from([
            "ldap-proxy",
            "probe",
            "-b",
            "dc=example,dc=com",
            "-D",
            "cn=admin,dc=example,dc=com",
            "-a",
            "memberOf",
            "-a",
            "cn",
        ])
        .unwrap();

        assert!(matches!(cli.command, Some(Commands::Probe(_))));
    }

    #[test]
    fn test_rejects_unknown_fault_policy() {
        assert!(Cli::try_parse_from(["ldap-proxy", "--fault-policy", "explode"]).is_err());
    }
}
