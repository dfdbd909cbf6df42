use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Verbose per-exchange logging
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Inbound header carrying the client's correlation id
    #[serde(default = "default_tracking_header")]
    pub tracking_header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// PEM encoded CA certificate used to sign intercepted hosts
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    /// Unencrypted PEM private key matching `ca_cert_path`
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Capacity of the sample queue. Response reads block while it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// `host:port` of the Graphite plaintext listener; empty logs samples instead
    #[serde(default)]
    pub graphite_server: String,
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3128
}

fn default_tracking_header() -> String {
    "x-dasein-id".to_string()
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("pki/CA/certs/ca.cert.pem")
}

fn default_ca_key_path() -> PathBuf {
    PathBuf::from("pki/CA/private/ca.key.pem.clear")
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_metric_prefix() -> String {
    "cloudproxy".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            tracking_header: default_tracking_header(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: default_ca_cert_path(),
            ca_key_path: default_ca_key_path(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            graphite_server: String::new(),
            metric_prefix: default_metric_prefix(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl TelemetryConfig {
    /// The configured backend, `None` when samples go to the log
    pub fn backend(&self) -> Option<&str> {
        let server = self.graphite_server.trim();
        if server.is_empty() {
            None
        } else {
            Some(server)
        }
    }
}
