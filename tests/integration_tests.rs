use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use sitemux::handler::{handler_fn, Respond, ResponseBody};
use sitemux::ssl_cert_gen::CertificateGenerator;
use sitemux::{BoundServer, Config, Server, ServerError, Site};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Running {
    addrs: Vec<(u16, SocketAddr)>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    fn addr(&self, port: u16) -> SocketAddr {
        self.addrs
            .iter()
            .find(|(configured, _)| *configured == port)
            .map(|(_, addr)| *addr)
            .unwrap()
    }

    async fn stop(self) -> Result<(), ServerError> {
        let _ = self.stop.send(());
        self.task.await.unwrap()
    }
}

async fn start(server: Server) -> Running {
    let bound: BoundServer = server
        .with_bind_address(LOCALHOST)
        .with_drain_timeout(Duration::from_secs(2))
        .bind()
        .await
        .unwrap();
    let addrs = bound.local_addrs();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(bound.run(async {
        let _ = stopped.await;
    }));
    Running { addrs, stop, task }
}

async fn get(addr: SocketAddr, host: &str, path: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header(HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn text_site(name: &str, port: u16, body: &'static str) -> Site {
    let mut site = Site::new(name, port);
    site.always(Respond::text(body));
    site
}

fn certificate(dir: &TempDir, name: &str) -> (PathBuf, PathBuf) {
    let cert = dir.path().join(format!("{name}.crt"));
    let key = dir.path().join(format!("{name}.key"));
    CertificateGenerator::generate_self_signed_cert(&[name.to_string()], &cert, &key).unwrap();
    (cert, key)
}

fn secure_site(dir: &TempDir, name: &str, body: &'static str, http2: bool) -> Site {
    let (cert, key) = certificate(dir, name);
    let mut site = Site::secure(name, 0, cert, key).with_http2(http2);
    site.always(Respond::text(body));
    site
}

#[tokio::test]
async fn test_single_plain_site() {
    let mut site = Site::new("a.test", 0);
    site.equals(Respond::text("home"), ["/"])
        .has_prefix(Respond::text("images"), ["/img/"]);
    let running = start(Server::new().add(site)).await;
    let addr = running.addr(0);

    assert_eq!(get(addr, "a.test", "/").await, (StatusCode::OK, "home".to_string()));
    assert_eq!(
        get(addr, "anything.else", "/img/logo.png").await,
        (StatusCode::OK, "images".to_string())
    );
    assert_eq!(get(addr, "a.test", "/missing").await.0, StatusCode::NOT_FOUND);

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_sites_sharing_a_port_route_by_host() {
    let server = Server::from_sites([
        text_site("a.test", 0, "site a"),
        text_site("b.test", 0, "site b"),
    ]);
    let running = start(server).await;
    assert_eq!(running.addrs.len(), 1);
    let addr = running.addr(0);

    assert_eq!(get(addr, "a.test", "/").await.1, "site a");
    assert_eq!(get(addr, &format!("b.test:{}", addr.port()), "/").await.1, "site b");
    assert_eq!(get(addr, "www.b.test", "/").await.1, "site b");
    assert_eq!(get(addr, "c.test", "/").await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(addr, "a.test:port:1", "/").await.0, StatusCode::NOT_FOUND);

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn test_in_flight_request_finishes_during_shutdown() {
    let mut site = Site::new("slow.test", 0);
    site.always(handler_fn(|_req| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        hyper::Response::new(ResponseBody::from("done"))
    }));
    let running = start(Server::new().add(site)).await;
    let addr = running.addr(0);

    let request = tokio::spawn(async move { get(addr, "slow.test", "/").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(running.stop().await.is_ok());
    assert_eq!(request.await.unwrap(), (StatusCode::OK, "done".to_string()));
}

#[tokio::test]
async fn test_empty_server_is_rejected() {
    let result = Server::new().serve().await;
    assert!(matches!(result, Err(ServerError::NoSites)));
}

#[tokio::test]
async fn test_mixed_tls_port_binds_nothing() {
    let dir = TempDir::new().unwrap();
    let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();
    drop(taken);

    let (cert, key) = certificate(&dir, "secure.test");
    let server = Server::from_sites([
        text_site("plain.test", port, "plain"),
        Site::secure("secure.test", port, cert, key),
    ])
    .with_bind_address(LOCALHOST);

    match server.bind().await {
        Err(ServerError::MixedTls { port: p, secure, plain }) => {
            assert_eq!(p, port);
            assert_eq!(secure, vec!["secure.test"]);
            assert_eq!(plain, vec!["plain.test"]);
        }
        other => panic!("expected MixedTls, got {:?}", other.err()),
    }

    // Nothing was left listening on the port.
    assert!(std::net::TcpListener::bind((LOCALHOST, port)).is_ok());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let result = Server::from_sites([text_site("a.test", 0, "a"), text_site("b.test", port, "b")])
        .with_bind_address(LOCALHOST)
        .bind()
        .await;

    match result {
        Err(ServerError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
        other => panic!("expected Bind, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_missing_certificate_is_reported() {
    let dir = TempDir::new().unwrap();
    let site = Site::secure(
        "secure.test",
        0,
        dir.path().join("missing.crt"),
        dir.path().join("missing.key"),
    );

    let result = Server::new().add(site).check();
    match result {
        Err(e @ ServerError::Certificate { .. }) => assert!(e.is_configuration()),
        other => panic!("expected Certificate, got {:?}", other.err()),
    }
}

mod tls {
    use super::*;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    fn connector(dir: &TempDir, names: &[&str]) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for name in names {
            let pem = std::fs::read(dir.path().join(format!("{name}.crt"))).unwrap();
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                roots.add(cert.unwrap()).unwrap();
            }
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        TlsConnector::from(Arc::new(config))
    }

    async fn connect(
        connector: &TlsConnector,
        addr: SocketAddr,
        name: &'static str,
    ) -> TlsStream<TcpStream> {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from(name).unwrap();
        connector.connect(server_name, tcp).await.unwrap()
    }

    fn leaf_certificate(dir: &TempDir, name: &str) -> Vec<u8> {
        let pem = std::fs::read(dir.path().join(format!("{name}.crt"))).unwrap();
        let cert = rustls_pemfile::certs(&mut &pem[..]).next().unwrap().unwrap();
        cert.as_ref().to_vec()
    }

    #[tokio::test]
    async fn test_sni_selects_site_certificate() {
        let dir = TempDir::new().unwrap();
        let server = Server::from_sites([
            secure_site(&dir, "a.test", "secure a", false),
            secure_site(&dir, "b.test", "secure b", false),
        ]);
        let running = start(server).await;
        let addr = running.addr(0);
        let connector = connector(&dir, &["a.test", "b.test"]);

        let stream = connect(&connector, addr, "b.test").await;
        {
            let (_, conn) = stream.get_ref();
            let presented = conn.peer_certificates().unwrap()[0].as_ref().to_vec();
            assert_eq!(presented, leaf_certificate(&dir, "b.test"));
            assert_ne!(conn.alpn_protocol(), Some(&b"h2"[..]));
        }

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);
        let req = Request::builder()
            .uri("/")
            .header(HOST, "b.test")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"secure b");

        let stream = connect(&connector, addr, "a.test").await;
        let (_, conn) = stream.get_ref();
        let presented = conn.peer_certificates().unwrap()[0].as_ref().to_vec();
        assert_eq!(presented, leaf_certificate(&dir, "a.test"));

        assert!(running.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_http2_negotiated_through_alpn() {
        let dir = TempDir::new().unwrap();
        let server = Server::new().add(secure_site(&dir, "h2.test", "over h2", true));
        let running = start(server).await;
        let addr = running.addr(0);
        let connector = connector(&dir, &["h2.test"]);

        let stream = connect(&connector, addr, "h2.test").await;
        assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .unwrap();
        tokio::spawn(conn);
        let req = Request::builder()
            .uri(format!("https://h2.test:{}/", addr.port()))
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"over h2");

        assert!(running.stop().await.is_ok());
    }
}

#[tokio::test]
async fn test_server_from_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>static</h1>").unwrap();

    let content = format!(
        r#"
[server]
bind_address = "127.0.0.1"
drain_timeout = 1

[[site]]
name = "files.test"
port = 0

[[site.route]]
match = "prefix"
patterns = ["/old/"]
action = {{ kind = "redirect_https" }}

[[site.route]]
match = "always"
action = {{ kind = "static", root = "{}" }}
cache_for = 3600
"#,
        dir.path().display()
    );
    let server = Config::from_toml(&content).unwrap().into_server().unwrap();
    let running = start(server).await;
    let addr = running.addr(0);

    let (status, body) = get(addr, "files.test", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<h1>static</h1>");

    let (status, _) = get(addr, "files.test", "/old/page").await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);

    assert!(running.stop().await.is_ok());
}
