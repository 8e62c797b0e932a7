use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Bridge configuration loaded from YAML.
///
/// Defines where the bridge listens, which CONNECT targets are handed to the
/// embedded server, whether unmatched targets are forwarded, timeouts and the
/// metrics endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// List of addresses to listen on (e.g., "0.0.0.0:8080", "[::]:8080")
    pub listen_addrs: Vec<String>,
    /// CONNECT targets delivered to the embedded server. Entries are
    /// `host` or `host:port`; a missing port means 443.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Splice CONNECT requests for unknown targets directly to the target
    /// instead of rejecting them (default: false)
    #[serde(default)]
    pub forward_connect: bool,
    /// Plain HTTP address the embedded server relays tunneled requests to
    #[serde(default)]
    pub upstream: Option<String>,
    /// Answer `GET /healthz` for non-CONNECT requests (default: true)
    #[serde(default = "default_serve_health")]
    pub serve_health: bool,
    /// Timeout configuration for various operations
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Prometheus metrics configuration
    pub metrics: Metrics,
}

fn default_serve_health() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handoff_timeout() -> u64 {
    30
}

fn default_request_header_timeout() -> u64 {
    10
}

/// Timeout settings for bridge operations (all values in seconds).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Timeouts {
    /// Maximum time to dial a forwarded CONNECT target (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Maximum time a hijacked connection waits for the embedded server
    /// (default: 30s)
    #[serde(default = "default_handoff_timeout")]
    pub handoff: u64,
    /// Maximum time to receive a complete request head (default: 10s)
    #[serde(default = "default_request_header_timeout")]
    pub request_header: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            handoff: default_handoff_timeout(),
            request_header: default_request_header_timeout(),
        }
    }
}

/// Prometheus metrics server configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    pub address: String,
}

/// Reasons a parsed configuration is rejected by [`Config::validate`].
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    NoListenAddrs,
    InvalidListenAddr(String),
    EmptyTarget,
    ZeroTimeout(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoListenAddrs => write!(f, "No listen addresses configured"),
            ConfigError::InvalidListenAddr(addr) => write!(f, "Invalid listen address: {}", addr),
            ConfigError::EmptyTarget => write!(f, "Empty CONNECT target"),
            ConfigError::ZeroTimeout(name) => write!(f, "Timeout {} must be positive", name),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use connbridge_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses configuration from a YAML string.
    ///
    /// This is primarily used for testing and programmatic configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use connbridge_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "0.0.0.0:8080"
    /// targets:
    ///   - "internal.example"
    /// metrics:
    ///   enabled: true
    ///   address: "127.0.0.1:9000"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.targets[0], "internal.example");
    /// assert_eq!(config.timeouts.handoff, 30);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }

    /// Checks the semantic constraints YAML deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addrs.is_empty() {
            return Err(ConfigError::NoListenAddrs);
        }
        for addr in &self.listen_addrs {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::InvalidListenAddr(addr.clone()));
            }
        }
        if self.targets.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyTarget);
        }
        let timeouts = [
            ("connect", self.timeouts.connect),
            ("handoff", self.timeouts.handoff),
            ("request_header", self.timeouts.request_header),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::ZeroTimeout(*name));
        }
        Ok(())
    }
}
