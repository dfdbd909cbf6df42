use super::context::ExchangeContext;
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::telemetry::{CountingBody, HitCounters, MetricNames, MetricSample};
use bytes::Bytes;
use http::{HeaderName, Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::Body;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Interception points the proxy engine calls for every exchange.
///
/// Whatever `on_request` returns is handed, unchanged and by value, to the
/// `on_response` call for the same exchange. The engine never calls
/// `on_response` without a matching `on_request`.
pub trait ProxyHooks: Send + Sync + 'static {
    type Context: Send + 'static;

    /// Observes a request before it is forwarded. The request itself cannot
    /// be modified or answered here.
    fn on_request<B>(&self, req: &Request<B>, client_addr: SocketAddr) -> Self::Context;

    /// Receives the upstream response and returns what the client will see
    fn on_response<B>(
        &self,
        res: Response<B>,
        ctx: Self::Context,
    ) -> Response<UnsyncBoxBody<Bytes, B::Error>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static;
}

/// Hooks that tag each exchange and count its response body
pub struct TelemetryHooks {
    prefix: String,
    tracking_header: HeaderName,
    hits: Arc<HitCounters>,
    sender: mpsc::Sender<MetricSample>,
}

impl TelemetryHooks {
    pub fn new(
        prefix: impl Into<String>,
        tracking_header: HeaderName,
        hits: Arc<HitCounters>,
        sender: mpsc::Sender<MetricSample>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            tracking_header,
            hits,
            sender,
        }
    }

    pub fn from_config(
        config: &Config,
        hits: Arc<HitCounters>,
        sender: mpsc::Sender<MetricSample>,
    ) -> Result<Self> {
        let tracking_header = HeaderName::from_bytes(config.proxy.tracking_header.as_bytes())
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "invalid tracking header '{}': {}",
                    config.proxy.tracking_header, e
                ))
            })?;

        Ok(Self::new(
            config.telemetry.metric_prefix.clone(),
            tracking_header,
            hits,
            sender,
        ))
    }

    pub fn metric_names(&self, ctx: &ExchangeContext) -> MetricNames {
        MetricNames::new(&self.prefix, ctx.correlation_id.as_deref(), &ctx.host)
    }
}

impl ProxyHooks for TelemetryHooks {
    type Context = ExchangeContext;

    fn on_request<B>(&self, req: &Request<B>, client_addr: SocketAddr) -> ExchangeContext {
        debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, "Proxying request");
        ExchangeContext::capture(req, &self.tracking_header, client_addr)
    }

    fn on_response<B>(
        &self,
        res: Response<B>,
        ctx: ExchangeContext,
    ) -> Response<UnsyncBoxBody<Bytes, B::Error>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
    {
        let names = self.metric_names(&ctx);
        debug!(
            status = %res.status(),
            host = %ctx.host,
            header = %self.tracking_header,
            correlation_id = ctx.correlation_id.as_deref().unwrap_or_default(),
            source = %ctx.source_address,
            "Responding to request"
        );

        let (parts, body) = res.into_parts();
        let counted = CountingBody::new(
            body,
            names,
            ctx.declared_content_length,
            self.hits.clone(),
            self.sender.clone(),
        );
        Response::from_parts(parts, counted.boxed_unsync())
    }
}
