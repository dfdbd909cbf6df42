//! Intercepting forward proxy and the hooks that instrument it

pub mod context;
pub mod hooks;
pub mod server;
pub mod tls_handler;
pub mod upstream;

pub use context::ExchangeContext;
pub use hooks::{ProxyHooks, TelemetryHooks};
pub use server::{ProxyBody, ProxyServer};
pub use tls_handler::TlsHandler;
pub use upstream::{Target, UpstreamClient};
