use bytes::Bytes;
use cloudproxy::proxy::{ProxyServer, TelemetryHooks, TlsHandler};
use cloudproxy::telemetry::{HitCounters, MetricSample};
use http::{HeaderName, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct TestCa {
    cert_pem: String,
    key_pem: String,
    der: CertificateDer<'static>,
}

fn generate_ca() -> TestCa {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Cloudproxy Integration CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    TestCa {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        der: cert.der().clone(),
    }
}

/// Origin server answering every request with `body`
async fn start_upstream(body: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    // drain the request body before answering
                    let _ = req.into_body().collect().await;
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// HTTPS origin holding a `localhost` certificate from the test CA. It
/// answers with the Host header it received.
async fn start_tls_upstream(ca: &TestCa) -> SocketAddr {
    let certs = TlsHandler::from_pem(&ca.cert_pem, &ca.key_pem).unwrap();
    let acceptor = TlsAcceptor::from(certs.get_server_config("localhost").unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(|req: Request<Incoming>| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .map(|v| v.as_bytes().to_vec())
                        .unwrap_or_default();
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(host))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });

    addr
}

fn trusting(ca: &TestCa) -> Arc<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.der.clone()).unwrap();
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

async fn start_proxy(ca: &TestCa, tx: mpsc::Sender<MetricSample>) -> SocketAddr {
    let tls = Arc::new(TlsHandler::from_pem(&ca.cert_pem, &ca.key_pem).unwrap());
    let client_config = tls.client_config();
    spawn_proxy(tls, client_config, tx).await
}

/// Proxy whose upstream connections trust the test CA
async fn start_proxy_trusting_ca(ca: &TestCa, tx: mpsc::Sender<MetricSample>) -> SocketAddr {
    let tls = Arc::new(TlsHandler::from_pem(&ca.cert_pem, &ca.key_pem).unwrap());
    spawn_proxy(tls, trusting(ca), tx).await
}

async fn spawn_proxy(
    tls: Arc<TlsHandler>,
    client_config: Arc<ClientConfig>,
    tx: mpsc::Sender<MetricSample>,
) -> SocketAddr {
    let hooks = TelemetryHooks::new(
        "cloudproxy",
        HeaderName::from_static("x-id"),
        Arc::new(HitCounters::new()),
        tx,
    );

    let server = ProxyServer::with_upstream_client_config("127.0.0.1:0", tls, hooks, client_config);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener, std::future::pending()));
    addr
}

async fn send_via_proxy<B>(proxy: SocketAddr, req: Request<B>) -> Response<Incoming>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    sender.send_request(req).await.unwrap()
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn drain(rx: &mut mpsc::Receiver<MetricSample>) -> Vec<MetricSample> {
    let mut samples = Vec::new();
    while let Ok(sample) = rx.try_recv() {
        samples.push(sample);
    }
    samples
}

#[tokio::test]
async fn test_plain_http_exchange_is_counted() {
    let ca = generate_ca();
    let (tx, mut rx) = mpsc::channel(64);
    let upstream = start_upstream(b"0123456789").await;
    let proxy = start_proxy(&ca, tx).await;

    let req = Request::post(format!("http://{}/upload", upstream))
        .header("x-id", "42")
        .header("content-length", "100")
        .body(Full::new(Bytes::from(vec![b'a'; 100])))
        .unwrap();
    let res = send_via_proxy(proxy, req).await;
    assert_eq!(res.status(), StatusCode::OK);

    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"0123456789");

    let samples = drain(&mut rx);
    assert!(!samples.is_empty());
    assert_eq!(samples.len() % 3, 0);

    let base = format!("cloudproxy.42.127_0_0_1_{}", upstream.port());
    for read in samples.chunks(3) {
        assert_eq!(read[0].name, format!("{base}.hits"));
        assert_eq!(read[1].name, format!("{base}.response_bytes"));
        assert_eq!(read[2].name, format!("{base}.request_bytes"));
        assert_eq!(read[2].value, 100);
    }
    let last = &samples[samples.len() - 3..];
    assert_eq!(last[0].value as usize, samples.len() / 3);
    assert_eq!(last[1].value, 10);
}

#[tokio::test]
async fn test_missing_header_uses_fallback_bucket() {
    let ca = generate_ca();
    let (tx, mut rx) = mpsc::channel(64);
    let upstream = start_upstream(b"ok").await;
    let proxy = start_proxy(&ca, tx).await;

    let req = Request::get(format!("http://{}/", upstream))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = send_via_proxy(proxy, req).await;
    res.into_body().collect().await.unwrap();

    let samples = drain(&mut rx);
    assert_eq!(
        samples[0].name,
        format!("cloudproxy.missing_request_id.127_0_0_1_{}.hits", upstream.port())
    );
    assert_eq!(samples[2].value, 0);
}

#[tokio::test]
async fn test_origin_form_request_is_rejected() {
    let ca = generate_ca();
    let (tx, mut rx) = mpsc::channel(8);
    let proxy = start_proxy(&ca, tx).await;

    let req = Request::get("/not-a-proxy-request")
        .header("host", "a.b.com")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = send_via_proxy(proxy, req).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let ca = generate_ca();
    let (tx, mut rx) = mpsc::channel(8);
    let proxy = start_proxy(&ca, tx).await;
    let port = unused_port().await;

    let req = Request::get(format!("http://127.0.0.1:{}/", port))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = send_via_proxy(proxy, req).await;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    assert!(drain(&mut rx).is_empty());
}

/// Sends CONNECT for `authority` and speaks TLS inside the tunnel,
/// trusting only the test CA
async fn open_tunnel(
    proxy: SocketAddr,
    authority: &str,
    ca: &TestCa,
) -> TlsStream<TokioIo<hyper::upgrade::Upgraded>> {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn.with_upgrades());

    let connect = Request::connect(authority)
        .header("host", authority)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = sender.send_request(connect).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let upgraded = hyper::upgrade::on(res).await.unwrap();

    TlsConnector::from(trusting(ca))
        .connect(ServerName::try_from("localhost").unwrap(), TokioIo::new(upgraded))
        .await
        .expect("client should accept the minted certificate")
}

#[tokio::test]
async fn test_connect_is_intercepted_with_minted_certificate() {
    let ca = generate_ca();
    let (tx, _rx) = mpsc::channel(8);
    let proxy = start_proxy(&ca, tx).await;
    let port = unused_port().await;

    let tls = open_tunnel(proxy, &format!("localhost:{}", port), &ca).await;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    // nothing listens upstream, so the intercepted request ends in 502
    let req = Request::get("/")
        .header("host", "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = sender.send_request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_tunnelled_https_exchange_is_counted() {
    let ca = generate_ca();
    let (tx, mut rx) = mpsc::channel(64);
    let upstream = start_tls_upstream(&ca).await;
    let proxy = start_proxy_trusting_ca(&ca, tx).await;

    let tls = open_tunnel(proxy, &format!("localhost:{}", upstream.port()), &ca).await;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    // no Host header: the proxy fills it from the CONNECT host
    let req = Request::get("/")
        .header("x-id", "42")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = sender.send_request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"localhost");

    let samples = drain(&mut rx);
    assert!(!samples.is_empty());
    assert_eq!(samples.len() % 3, 0);
    for read in samples.chunks(3) {
        assert_eq!(read[0].name, "cloudproxy.42.localhost.hits");
        assert_eq!(read[1].name, "cloudproxy.42.localhost.response_bytes");
        assert_eq!(read[2].name, "cloudproxy.42.localhost.request_bytes");
        assert_eq!(read[2].value, 0);
    }
    let last = &samples[samples.len() - 3..];
    assert_eq!(last[0].value as usize, samples.len() / 3);
    assert_eq!(last[1].value, 9);
}
