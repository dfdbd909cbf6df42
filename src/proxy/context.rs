use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, Request};
use std::net::SocketAddr;

/// Identity of one proxied exchange, captured when its request arrives and
/// consumed when its response is wrapped. Never shared between exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeContext {
    /// Tracking header value; `None` when absent, empty, or not valid text
    pub correlation_id: Option<String>,
    /// Declared request body length: 0 without a body, -1 when unknown
    pub declared_content_length: i64,
    pub source_address: String,
    /// Target host as the client addressed it, port included when given
    pub host: String,
}

impl ExchangeContext {
    pub fn capture<B>(req: &Request<B>, tracking_header: &HeaderName, client_addr: SocketAddr) -> Self {
        let correlation_id = req
            .headers()
            .get(tracking_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Self {
            correlation_id,
            declared_content_length: declared_content_length(req.headers()),
            source_address: client_addr.to_string(),
            host: request_host(req),
        }
    }
}

/// Length from `Content-Length`; -1 for chunked or unparseable bodies
pub fn declared_content_length(headers: &HeaderMap) -> i64 {
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        return value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|len| *len >= 0)
            .unwrap_or(-1);
    }

    if headers.contains_key(TRANSFER_ENCODING) {
        -1
    } else {
        0
    }
}

/// Absolute-form authority wins over the `Host` header
pub fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        // drop any userinfo
        let addressed = authority.as_str();
        return addressed.rsplit('@').next().unwrap_or(addressed).to_string();
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
