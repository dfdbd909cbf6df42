//! Forwarding of a single request to its origin server

use crate::error::UpstreamError;
use http::header::{HeaderName, CONNECTION, HOST, PROXY_AUTHORIZATION, TE, TRAILER, UPGRADE};
use http::uri::{PathAndQuery, Scheme};
use http::{HeaderMap, HeaderValue, Request, Response, Uri};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Where an exchange is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Target of an absolute-form request URI
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let tls = match uri.scheme() {
            Some(s) if *s == Scheme::HTTPS => true,
            Some(s) if *s == Scheme::HTTP => false,
            _ => return None,
        };
        let host = uri.host()?.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

        Some(Self {
            tls,
            host: host.to_string(),
            port,
        })
    }

    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Opens one connection per exchange and speaks HTTP/1.1 over it
pub struct UpstreamClient {
    tls: TlsConnector,
}

impl UpstreamClient {
    pub fn new(client_config: Arc<ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(client_config),
        }
    }

    pub async fn send<B>(
        &self,
        req: Request<B>,
        target: &Target,
    ) -> Result<Response<Incoming>, UpstreamError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let req = prepare_request(req, target);
        let authority = target.authority();

        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| UpstreamError::ConnectFailed(authority.clone(), e))?;
        debug!(upstream = %authority, tls = target.tls, "Connected upstream");

        if target.tls {
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|_| UpstreamError::InvalidHost(target.host.clone()))?;
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| UpstreamError::Tls(authority.clone(), e))?;
            send_over(stream, req, authority).await
        } else {
            send_over(stream, req, authority).await
        }
    }
}

async fn send_over<S, B>(
    stream: S,
    req: Request<B>,
    authority: String,
) -> Result<Response<Incoming>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(UpstreamError::Handshake)?;

    // Drives the connection until the response body has been read out
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(upstream = %authority, error = %e, "Upstream connection closed with error");
        }
    });

    sender.send_request(req).await.map_err(UpstreamError::Request)
}

/// Rewrites a proxied request into what the origin expects: origin-form
/// URI, a `Host` header, no hop-by-hop headers
pub fn prepare_request<B>(req: Request<B>, target: &Target) -> Request<B> {
    let (mut parts, body) = req.into_parts();

    if !parts.headers.contains_key(HOST) {
        let host = if (target.tls && target.port == 443) || (!target.tls && target.port == 80) {
            target.host.clone()
        } else {
            target.authority()
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            parts.headers.insert(HOST, value);
        }
    }

    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path);

    strip_hop_by_hop(&mut parts.headers);
    Request::from_parts(parts, body)
}

const HOP_BY_HOP: [&str; 3] = ["proxy-connection", "keep-alive", "transfer-encoding"];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // headers named in Connection are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [CONNECTION, PROXY_AUTHORIZATION, TE, TRAILER, UPGRADE] {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
