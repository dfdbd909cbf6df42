use std::path::PathBuf;

/// Command-line values that take precedence over file and environment settings
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub tracking_header: Option<String>,
    pub queue_capacity: Option<usize>,
    pub graphite_server: Option<String>,
    pub metric_prefix: Option<String>,
    pub debug: bool,
}

impl CliOverrides {
    pub fn apply(self, config: &mut super::schema::Config) {
        if let Some(path) = self.ca_cert_path {
            config.tls.ca_cert_path = path;
        }
        if let Some(path) = self.ca_key_path {
            config.tls.ca_key_path = path;
        }
        if let Some(address) = self.address {
            config.proxy.address = address;
        }
        if let Some(port) = self.port {
            config.proxy.port = port;
        }
        if let Some(header) = self.tracking_header {
            config.proxy.tracking_header = header;
        }
        if let Some(capacity) = self.queue_capacity {
            config.telemetry.queue_capacity = capacity;
        }
        if let Some(server) = self.graphite_server {
            config.telemetry.graphite_server = server;
        }
        if let Some(prefix) = self.metric_prefix {
            config.telemetry.metric_prefix = prefix;
        }
        // --debug can only switch verbose logging on
        if self.debug {
            tracing::debug!("Debug logging enabled from command line");
            config.debug = true;
        }
    }
}
