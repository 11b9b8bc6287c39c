use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Proxy configuration loaded from YAML.
///
/// One immutable snapshot is built at startup and shared (behind `Arc`) by
/// every component: listeners, detectors, the dialer, the health manager and
/// the catch-all responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Socket deadline and health-probe timeout in seconds (default: 60)
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Maximum bytes peeked while scanning HTTP headers for Host (default: 4096)
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    /// Listen addresses, split by expected traffic kind
    #[serde(default)]
    pub listen: Listen,
    /// Restrict upstream dialing to IPv4 (default: false)
    #[serde(default)]
    pub forceipv4: bool,
    /// HTTP CONNECT forward proxy URL; empty means direct dialing
    #[serde(default)]
    pub proxy: String,
    /// Catch-all sinks for destinations that are not allow-listed
    pub catchall: CatchAll,
    /// Allowed domain suffixes; everything else routes to the catch-all
    #[serde(default)]
    pub alloweddomains: Vec<AllowedDomain>,
    /// Health-check tick interval in seconds; 0 disables the manager
    #[serde(default)]
    pub check: u64,
    /// Prometheus metrics endpoint
    #[serde(default)]
    pub metrics: Metrics,
}

/// Listen addresses grouped by the detector they get.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Listen {
    /// Plaintext listeners, routed by the HTTP Host header (e.g. "0.0.0.0:80")
    #[serde(default)]
    pub http: Vec<String>,
    /// TLS listeners, routed by the ClientHello SNI (e.g. "0.0.0.0:443")
    #[serde(default)]
    pub https: Vec<String>,
}

/// Sink authorities for disallowed destinations, one per traffic kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchAll {
    /// Authority dialed for disallowed plaintext destinations
    pub http: String,
    /// Authority dialed for disallowed TLS destinations
    pub https: String,
    /// Launch the built-in "Access denied." responder on the two authorities
    #[serde(default)]
    pub serve: bool,
    /// PEM certificate chain for the responder's HTTPS side
    #[serde(default)]
    pub cert: String,
    /// PEM private key for the responder's HTTPS side
    #[serde(default)]
    pub key: String,
}

/// One allow-list entry.
///
/// `name` is a hostname suffix; the health manager also resolves and probes
/// it when checks are enabled, restricted to `protocol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedDomain {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Which reachability probes run for an allow-listed site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    #[default]
    Both,
}

impl Protocol {
    pub fn probes_http(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Both)
    }

    pub fn probes_https(self) -> bool {
        matches!(self, Protocol::Https | Protocol::Both)
    }
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to expose metrics
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (e.g. "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_buffer() -> usize {
    4096
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config = serde_yaml_ng::from_str(&contents)?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use spliceproxy_config::Config;
    ///
    /// let yaml = r#"
    /// listen:
    ///   https:
    ///     - "0.0.0.0:443"
    /// catchall:
    ///   http: "deny.internal:80"
    ///   https: "deny.internal:443"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen.https[0], "0.0.0.0:443");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }

    /// Whether `hostname` matches the allow-list.
    ///
    /// Membership is a suffix match: the entry `example.com` admits
    /// `api.example.com` and `example.com` itself. No leading-dot anchor is
    /// applied, so `evilexample.com` also matches; operators who want
    /// anchored matching list `.example.com` instead. Comparison is ASCII
    /// case-insensitive.
    pub fn allowed(&self, hostname: &str) -> bool {
        if hostname.is_empty() {
            return false;
        }
        let hostname = hostname.to_ascii_lowercase();
        self.alloweddomains
            .iter()
            .any(|d| hostname.ends_with(&d.name.to_ascii_lowercase()))
    }

    /// Maps a detected destination to the authority to dial.
    ///
    /// Allow-listed hostnames keep their own authority (`hostname` plus the
    /// listener's `:port` tag); everything else, including an empty
    /// hostname, gets the catch-all for the traffic kind. The returned flag
    /// is true for catch-all routes, which must be dialed directly and may
    /// target loopback.
    pub fn route(&self, id: &str, hostname: &str, port: &str, tls: bool) -> (String, bool) {
        if self.allowed(hostname) {
            debug!(id, hostname, "destination allowed");
            return (format!("{hostname}{port}"), false);
        }
        let catchall = if tls {
            self.catchall.https.clone()
        } else {
            self.catchall.http.clone()
        };
        debug!(id, hostname, catchall, "destination routed to catch-all");
        (catchall, true)
    }
}
