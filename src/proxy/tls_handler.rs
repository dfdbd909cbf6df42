//! Certificate handling for TLS interception
//!
//! The CA certificate and key are loaded from PEM files at start-up; any
//! problem with them is fatal. Per-host leaf certificates are minted on
//! demand, signed by that CA, and cached as ready-to-use `ServerConfig`s.

use crate::error::TlsError;
use dashmap::DashMap;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    SanType,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Host used to mint the start-up check certificate; never served
const SELF_CHECK_HOST: &str = "cloudproxy.invalid";

pub struct TlsHandler {
    /// CA as re-signed by rcgen; used only as the issuer when signing
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// CA exactly as read from disk, sent as the chain's second element
    ca_der: CertificateDer<'static>,
    server_configs: DashMap<String, Arc<ServerConfig>>,
    client_config: Arc<ClientConfig>,
}

impl TlsHandler {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            TlsError::CaLoad(format!("cannot read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| {
            TlsError::CaLoad(format!("cannot read {}: {}", key_path.display(), e))
        })?;

        let handler = Self::from_pem(&cert_pem, &key_pem)?;
        tracing::info!(
            ca_cert_path = ?cert_path,
            ca_key_path = ?key_path,
            "Loaded interception CA"
        );
        Ok(handler)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| TlsError::CaLoad(format!("invalid CA private key: {}", e)))?;

        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| TlsError::CaLoad("no certificate found in CA PEM".to_string()))?
            .map_err(|e| TlsError::CaLoad(format!("invalid CA PEM: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| TlsError::CaLoad(format!("invalid CA certificate: {}", e)))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| TlsError::CaLoad(format!("CA key cannot sign: {}", e)))?;

        let handler = Self {
            ca_cert,
            ca_key,
            ca_der,
            server_configs: DashMap::new(),
            client_config: Arc::new(Self::build_client_config()),
        };

        // A key pair that cannot produce a usable leaf is as fatal as a missing file
        handler.verify_key_matches_cert()?;
        handler.get_server_config(SELF_CHECK_HOST)?;
        handler.server_configs.clear();

        Ok(handler)
    }

    /// Mints a leaf and checks it chains to the CA certificate from disk.
    /// Fails when the private key belongs to a different key pair.
    fn verify_key_matches_cert(&self) -> Result<(), TlsError> {
        let (leaf, _) = self.generate_host_cert(SELF_CHECK_HOST)?;

        let mut roots = RootCertStore::empty();
        roots
            .add(self.ca_der.clone())
            .map_err(|e| TlsError::CaLoad(format!("CA certificate is not a usable trust anchor: {}", e)))?;
        let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::CaLoad(e.to_string()))?;
        let server_name = ServerName::try_from(SELF_CHECK_HOST)
            .map_err(|e| TlsError::CaLoad(e.to_string()))?;

        verifier
            .verify_server_cert(leaf.der(), &[], &server_name, &[], UnixTime::now())
            .map_err(|e| {
                TlsError::CaLoad(format!("CA private key does not match the CA certificate: {}", e))
            })?;
        Ok(())
    }

    fn build_client_config() -> ClientConfig {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        config
    }

    fn generate_host_cert(&self, host: &str) -> Result<(Certificate, KeyPair), TlsError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(90);

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string().try_into().map_err(|e| {
                TlsError::CertGeneration(format!("invalid host name {}: {:?}", host, e))
            })?),
        };
        params.subject_alt_names = vec![san];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        Ok((cert, key_pair))
    }

    /// Returns the cached `ServerConfig` for `host`, minting one if needed
    pub fn get_server_config(&self, host: &str) -> Result<Arc<ServerConfig>, TlsError> {
        if let Some(config) = self.server_configs.get(host) {
            tracing::debug!(host = host, "Using cached ServerConfig");
            return Ok(config.clone());
        }

        tracing::debug!(host = host, "Generating certificate");
        let (cert, key_pair) = self.generate_host_cert(host)?;

        let chain = vec![cert.der().clone(), self.ca_der.clone()];
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        let config = Arc::new(config);
        self.server_configs.insert(host.to_string(), config.clone());
        Ok(config)
    }

    /// Config for the proxy's own upstream connections
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    #[cfg(test)]
    pub(crate) fn cached_hosts(&self) -> usize {
        self.server_configs.len()
    }
}
