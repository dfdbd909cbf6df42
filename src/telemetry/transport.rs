//! Delivery of metric samples to Graphite or the process log
//!
//! Exactly one transport task runs per process. It connects to the backend
//! once at start-up and never reconnects: a failed dial or a broken
//! connection means samples are dropped (and logged) while proxy traffic
//! keeps flowing. There is no batching and no retry.

use super::MetricSample;
use crate::config::TelemetryConfig;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Destination for rendered samples
#[async_trait]
pub trait MetricSink: Send + 'static {
    /// Delivers one sample. Failures are handled inside the sink.
    async fn write(&mut self, sample: &MetricSample);

    fn name(&self) -> &'static str;
}

/// Graphite plaintext protocol over a single TCP connection
pub struct GraphiteSink {
    server: String,
    writer: Option<BufWriter<TcpStream>>,
}

impl GraphiteSink {
    /// Dials `server` once. A failed dial is logged and leaves the sink
    /// disconnected for the rest of the process.
    pub async fn connect(server: &str) -> Self {
        let writer = match TcpStream::connect(server).await {
            Ok(stream) => {
                info!(server = %server, "Connected to graphite");
                Some(BufWriter::new(stream))
            }
            Err(e) => {
                error!(server = %server, error = %e, "Error making initial connection to graphite");
                None
            }
        };

        Self {
            server: server.to_string(),
            writer,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}

#[async_trait]
impl MetricSink for GraphiteSink {
    async fn write(&mut self, sample: &MetricSample) {
        let Some(writer) = self.writer.as_mut() else {
            debug!(server = %self.server, metric = %sample.name, "No graphite connection, dropping sample");
            return;
        };

        let line = sample.to_line();
        let result = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(server = %self.server, metric = %sample.name, error = %e, "Failed to write sample to graphite");
        }
    }

    fn name(&self) -> &'static str {
        "graphite"
    }
}

/// Fallback when no backend is configured: one log line per sample
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl MetricSink for LogSink {
    async fn write(&mut self, sample: &MetricSample) {
        info!(target: "cloudproxy::telemetry", "{}", sample);
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// The single background worker draining the sample queue
pub struct TelemetryTransport {
    backend: Option<String>,
    queue_capacity: usize,
}

impl TelemetryTransport {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            backend: config.backend().map(str::to_string),
            queue_capacity: config.queue_capacity,
        }
    }

    /// Creates the bounded queue and starts the worker on it.
    ///
    /// Producers block once `queue_capacity` samples are waiting. The worker
    /// exits only when every sender has been dropped.
    pub fn spawn(self) -> (mpsc::Sender<MetricSample>, JoinHandle<u64>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let backend = self.backend;
        let capacity = self.queue_capacity;

        let handle = tokio::spawn(async move {
            info!(capacity, "Starting metric sender");
            let sink = open_sink(backend.as_deref()).await;
            Self::run(rx, sink).await
        });

        (tx, handle)
    }

    /// Drains `rx` into `sink` in arrival order, returning the number of
    /// samples handed to the sink
    pub async fn run<S>(mut rx: mpsc::Receiver<MetricSample>, mut sink: S) -> u64
    where
        S: MetricSink,
    {
        let mut delivered = 0u64;
        while let Some(sample) = rx.recv().await {
            sink.write(&sample).await;
            delivered += 1;
        }
        info!(sink = sink.name(), delivered, "Metric sender stopped");
        delivered
    }
}

/// Picks the sink for the configured backend
pub async fn open_sink(backend: Option<&str>) -> Box<dyn MetricSink> {
    match backend {
        Some(server) => {
            info!(server = %server, "Graphite server defined, sending samples to graphite");
            Box::new(GraphiteSink::connect(server).await)
        }
        None => {
            info!("No graphite server defined, sending samples to log");
            Box::new(LogSink)
        }
    }
}

#[async_trait]
impl MetricSink for Box<dyn MetricSink> {
    async fn write(&mut self, sample: &MetricSample) {
        (**self).write(sample).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
