//! Configuration module for Polygate
//!
//! A single TOML file, `config.toml` by default. Top-level keys set the
//! bind address and per-protocol ports; per-listener sections toggle and
//! tune each ingress. The `[auth]` and `[ruleset]` sections feed the
//! minimal built-in credential and rule stores; richer stores plug in
//! behind the same traits.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_https_port")]
    pub https_port: u16,

    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    #[serde(default)]
    pub http: HttpSection,

    /// HTTPS is off unless the section is present (it needs TLS material).
    #[serde(default)]
    pub https: Option<HttpsSection>,

    #[serde(default)]
    pub socks: SocksSection,

    #[serde(default)]
    pub auth: AuthSection,

    #[serde(default)]
    pub ruleset: RulesetSection,

    /// Raw TCP forwarder, off unless the section is present.
    #[serde(default)]
    pub tcp: Option<RawSection>,

    /// Raw UDP forwarder, off unless the section is present.
    #[serde(default)]
    pub udp: Option<RawSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpsSection {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub tls_cert_file: String,
    #[serde(default)]
    pub tls_key_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksSection {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub auth_enabled: bool,
    /// Wire parity: the SOCKS5 success reply goes out before the dial.
    /// Set to false to hold it until the dial outcome is known.
    #[serde(default = "default_true")]
    pub reply_before_dial: bool,
}

impl Default for SocksSection {
    fn default() -> Self {
        Self {
            disabled: false,
            auth_enabled: false,
            reply_before_dial: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// user -> password table for the built-in credential store
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesetSection {
    /// Denied destinations: exact IPs or domain suffixes
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSection {
    pub port: u16,
    /// `host:port` forward target for connections on this listener
    #[serde(default)]
    pub destination: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_socks_port() -> u16 {
    1080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "load config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("parse config: {}", e)))
    }

    /// Combine the bind address with a listener port
    pub fn listen_addr(&self, port: u16) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|_| Error::Config(format!("invalid bind address: {}", self.bind)))?;
        Ok(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.https_port, 8443);
        assert_eq!(config.socks_port, 1080);
        assert!(!config.http.disabled);
        assert!(!config.socks.disabled);
        assert!(config.socks.reply_before_dial);
        assert!(config.https.is_none());
        assert!(config.tcp.is_none());
        assert!(config.auth.users.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml(
            r#"
bind = "127.0.0.1"
http_port = 3128
socks_port = 1081

[http]
verbose = true

[https]
tls_cert_file = "/etc/polygate/cert.pem"
tls_key_file = "/etc/polygate/key.pem"

[socks]
auth_enabled = true
reply_before_dial = false

[auth]
users = { alice = "secret", bob = "hunter2" }

[ruleset]
deny = ["blocked.test", "10.1.2.3"]

[udp]
port = 5353
destination = "192.0.2.1:53"
"#,
        )
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.http_port, 3128);
        assert!(config.http.verbose);
        let https = config.https.unwrap();
        assert_eq!(https.tls_cert_file, "/etc/polygate/cert.pem");
        assert!(config.socks.auth_enabled);
        assert!(!config.socks.reply_before_dial);
        assert_eq!(config.auth.users["alice"], "secret");
        assert_eq!(config.ruleset.deny.len(), 2);
        let udp = config.udp.unwrap();
        assert_eq!(udp.port, 5353);
        assert_eq!(udp.destination.as_deref(), Some("192.0.2.1:53"));
    }

    #[test]
    fn test_listen_addr() {
        let config = Config::from_toml("bind = \"127.0.0.1\"").unwrap();
        assert_eq!(
            config.listen_addr(8080).unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let config = Config::from_toml("bind = \"not an ip\"").unwrap();
        assert!(matches!(config.listen_addr(80), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(matches!(
            Config::from_toml("bind = ["),
            Err(Error::Config(_))
        ));
    }
}
