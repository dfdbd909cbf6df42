//! Usage telemetry for proxied exchanges
//!
//! Response bodies are wrapped in a [`CountingBody`] that publishes three
//! [`MetricSample`]s on every data read into a bounded queue. A single
//! [`TelemetryTransport`] task drains that queue into Graphite, or into the
//! process log when no Graphite server is configured.

pub mod counting_body;
pub mod registry;
pub mod transport;

pub use counting_body::CountingBody;
pub use registry::HitCounters;
pub use transport::{GraphiteSink, LogSink, MetricSink, TelemetryTransport};

use std::fmt;

/// Correlation segment used when the client sent no tracking header.
/// Unrelated requests without an id aggregate under this one bucket.
pub const MISSING_REQUEST_ID: &str = "missing_request_id";

/// One named, timestamped integer measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub name: String,
    pub value: i64,
    /// Unix seconds
    pub timestamp: i64,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: i64, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }

    /// Graphite plaintext protocol line, newline terminated
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for MetricSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.value, self.timestamp)
    }
}

/// Replaces the characters that would break the metric hierarchy
pub fn sanitize_host(host: &str) -> String {
    host.replace(|c: char| c == '.' || c == ':', "_")
}

/// The three metric names emitted for one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNames {
    pub hits: String,
    pub response_bytes: String,
    pub request_bytes: String,
}

impl MetricNames {
    /// Builds `<prefix>.<correlation id or missing_request_id>.<sanitized host>.<suffix>`
    pub fn new(prefix: &str, correlation_id: Option<&str>, host: &str) -> Self {
        let id = correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or(MISSING_REQUEST_ID);
        let base = format!("{}.{}.{}", prefix, id, sanitize_host(host));

        Self {
            hits: format!("{base}.hits"),
            response_bytes: format!("{base}.response_bytes"),
            request_bytes: format!("{base}.request_bytes"),
        }
    }
}
