//! The intercepting forward proxy
//!
//! Plain HTTP requests arrive in absolute form and are forwarded as-is.
//! Every `CONNECT` is intercepted: the client gets a certificate for the
//! requested host signed by our CA, and the decrypted requests are then
//! forwarded one by one over a fresh TLS connection to the origin. Each
//! forwarded request passes through the configured [`ProxyHooks`].

use super::hooks::ProxyHooks;
use super::tls_handler::TlsHandler;
use super::upstream::{Target, UpstreamClient};
use crate::error::{ProxyError, Result, TlsError};
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub struct ProxyServer<H: ProxyHooks> {
    listen_addr: String,
    inner: Arc<Inner<H>>,
}

struct Inner<H> {
    tls: Arc<TlsHandler>,
    upstream: UpstreamClient,
    hooks: H,
}

impl<H: ProxyHooks> ProxyServer<H> {
    pub fn new(listen_addr: impl Into<String>, tls: Arc<TlsHandler>, hooks: H) -> Self {
        let client_config = tls.client_config();
        Self::with_upstream_client_config(listen_addr, tls, hooks, client_config)
    }

    /// Like [`ProxyServer::new`], but origins are verified with
    /// `client_config` instead of the public web roots
    pub fn with_upstream_client_config(
        listen_addr: impl Into<String>,
        tls: Arc<TlsHandler>,
        hooks: H,
        client_config: Arc<ClientConfig>,
    ) -> Self {
        let upstream = UpstreamClient::new(client_config);
        Self {
            listen_addr: listen_addr.into(),
            inner: Arc::new(Inner {
                tls,
                upstream,
                hooks,
            }),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Binds the configured address and serves until `shutdown` completes
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accepts connections from `listener` until `shutdown` completes.
    /// Connections already accepted keep running in their own tasks.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        inner.serve_client(stream, peer).await;
                    });
                }
                _ = &mut shutdown => {
                    info!("Proxy server stopped accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }
}

impl<H: ProxyHooks> Inner<H> {
    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(client = %peer, "Accepted connection");
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let inner = self.clone();
            async move { inner.handle(req, peer).await }
        });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!(client = %peer, error = %e, "Client connection error");
        }
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req, peer));
        }

        let Some(target) = Target::from_uri(req.uri()) else {
            warn!(uri = %req.uri(), "Invalid URI (missing scheme/authority)");
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "Proxy requests must use absolute-form URI",
            ));
        };

        Ok(self.exchange(req, peer, target).await)
    }

    /// Runs one request through the hooks and upstream
    async fn exchange(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        target: Target,
    ) -> Response<ProxyBody> {
        let ctx = self.hooks.on_request(&req, peer);

        match self.upstream.send(req, &target).await {
            Ok(res) => self.hooks.on_response(res, ctx),
            Err(e) => {
                warn!(upstream = %target.authority(), error = %e, "Upstream request failed");
                text_response(StatusCode::BAD_GATEWAY, "Failed to reach upstream")
            }
        }
    }

    fn handle_connect(self: Arc<Self>, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let authority = match req.uri().authority() {
            Some(auth) => auth.to_string(),
            None => {
                warn!("Missing authority in CONNECT request");
                return text_response(
                    StatusCode::BAD_REQUEST,
                    "CONNECT requires a valid host:port authority",
                );
            }
        };

        let (host, port) = match parse_authority(&authority) {
            Ok(parsed) => parsed,
            Err(msg) => {
                warn!(authority = %authority, "Invalid CONNECT authority: {}", msg);
                return text_response(StatusCode::BAD_REQUEST, &msg);
            }
        };

        debug!(authority = %authority, client = %peer, "Intercepting CONNECT");

        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    if let Err(e) = self.clone().intercept(upgraded, host, port, peer).await {
                        warn!(authority = %authority, error = %e, "Interception failed");
                    }
                }
                Err(e) => error!(authority = %authority, error = %e, "CONNECT upgrade failed"),
            }
        });

        Response::new(empty_body())
    }

    /// Terminates the client's TLS with a minted certificate and serves the
    /// tunnelled requests
    async fn intercept(
        self: Arc<Self>,
        upgraded: Upgraded,
        host: String,
        port: u16,
        peer: SocketAddr,
    ) -> Result<()> {
        let server_config = self.tls.get_server_config(&host)?;
        let tls_stream = TlsAcceptor::from(server_config)
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(|e| TlsError::Handshake(format!("{}: {}", host, e)))?;

        let service = service_fn(move |req| {
            let inner = self.clone();
            let target = Target {
                tls: true,
                host: host.clone(),
                port,
            };
            async move { Ok::<_, Infallible>(inner.handle_intercepted(req, peer, target).await) }
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
            .map_err(ProxyError::from)
    }

    async fn handle_intercepted(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        target: Target,
    ) -> Response<ProxyBody> {
        // origin-form requests name their host in the Host header
        if !req.headers().contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&target.host) {
                req.headers_mut().insert(HOST, value);
            }
        }
        self.exchange(req, peer, target).await
    }
}

/// Splits a CONNECT authority into host and port
pub fn parse_authority(authority: &str) -> std::result::Result<(String, u16), String> {
    // last colon, so [::1]:443 works
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| "Authority must be in host:port format".to_string())?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    let port: u16 = port
        .parse()
        .map_err(|_| format!("Invalid port '{}': must be a number between 1 and 65535", port))?;
    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    Ok((host.to_string(), port))
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut res = Response::new(body);
    *res.status_mut() = status;
    res
}
