use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to load CA material: {0}")]
    CaLoad(String),

    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Connection to {0} failed: {1}")]
    ConnectFailed(String, io::Error),

    #[error("Invalid upstream host: {0}")]
    InvalidHost(String),

    #[error("TLS to upstream {0} failed: {1}")]
    Tls(String, io::Error),

    #[error("Upstream handshake failed: {0}")]
    Handshake(hyper::Error),

    #[error("Upstream request failed: {0}")]
    Request(hyper::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
