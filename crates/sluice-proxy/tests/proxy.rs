//! End-to-end tests: a real listener on 127.0.0.1 in front of a local origin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sluice_core::{DefaultStrategy, HostRule, ListenerConfig, MemoryStore, Protocol, Session, TaskConfig};
use sluice_proxy::{
    crypto_provider, CaManager, CertificateAuthority, ProxyServer, Task, ALPN_H2, ALPN_HTTP1,
    CONNECT_ESTABLISHED,
};

const ORIGIN_BODY: &[u8] = b"hello from origin";

struct Harness {
    _dir: TempDir,
    capture: std::path::PathBuf,
    store: Arc<MemoryStore>,
    server: ProxyServer,
    proxy: SocketAddr,
    /// Shares the proxy's root, for minting origin certificates and
    /// trusting intercepted connections.
    authority: CertificateAuthority,
}

impl Harness {
    async fn start(config: TaskConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let bundle = CaManager::new(dir.path().join("ca")).ensure_ca().unwrap();
        let authority = CertificateAuthority::from_bundle(&bundle).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(authority.ca_der().clone()).unwrap();

        let capture = dir.path().join("capture");
        let store = Arc::new(MemoryStore::new());
        let config = config.with_listeners(vec![ListenerConfig::loopback(0)]);
        let task = Task::builder(config)
            .authority(CertificateAuthority::from_bundle(&bundle).unwrap())
            .roots(roots)
            .store(store.clone())
            .capture_dir(Some(capture.clone()))
            .build()
            .unwrap();

        let server = ProxyServer::new(task);
        server.start().unwrap();
        let proxy = server.local_addrs()[0];

        Self {
            _dir: dir,
            capture,
            store,
            server,
            proxy,
            authority,
        }
    }

    fn client_tls(&self, alpn: &[&[u8]]) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.authority.ca_der().clone()).unwrap();
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        TlsConnector::from(Arc::new(config))
    }

    fn origin_tls(&self) -> TlsAcceptor {
        let leaf = self.authority.leaf_for("127.0.0.1").unwrap();
        TlsAcceptor::from(self.authority.server_config(&leaf, &[ALPN_HTTP1]).unwrap())
    }

    /// Opens a CONNECT tunnel through the proxy and checks the acknowledgement.
    async fn connect(&self, origin: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(self.proxy).await.unwrap();
        let request = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CONNECT_ESTABLISHED);
        stream
    }

    /// Waits until a finished session matching `pred` has been stored.
    async fn finished_session(&self, pred: impl Fn(&Session) -> bool) -> Session {
        for _ in 0..100 {
            self.server.task().recorder().flush().await;
            if let Some(session) = self
                .store
                .all()
                .into_iter()
                .find(|s| s.end_time.is_some() && pred(s))
            {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no finished session; stored: {:#?}", self.store.all());
    }

    /// Lets in-flight connections settle, then returns everything stored.
    async fn settled_sessions(&self) -> Vec<Session> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.server.task().recorder().flush().await;
        self.store.all()
    }
}

/// Serves one HTTP/1.1 exchange per accepted connection, answering with
/// [`ORIGIN_BODY`]. Returns the request heads it saw.
async fn origin_http1(acceptor: Option<TlsAcceptor>) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        let Ok(tls) = acceptor.accept(stream).await else {
                            return;
                        };
                        answer_one(tls, tx).await;
                    }
                    None => answer_one(stream, tx).await,
                }
            });
        }
    });
    (addr, rx)
}

async fn answer_one<S>(mut io: S, heads: tokio::sync::mpsc::UnboundedSender<String>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let body_len = head
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + body_len {
        match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let _ = heads.send(head);

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        ORIGIN_BODY.len()
    );
    let _ = io.write_all(response.as_bytes()).await;
    let _ = io.write_all(ORIGIN_BODY).await;
    let _ = io.flush().await;
    let _ = io.shutdown().await;
}

async fn read_to_end<S: AsyncRead + Unpin>(mut io: S) -> String {
    let mut out = Vec::new();
    let _ = io.read_to_end(&mut out).await;
    String::from_utf8_lossy(&out).to_string()
}

#[tokio::test]
async fn plain_http_is_relayed_and_recorded() {
    let harness = Harness::start(TaskConfig::default()).await;
    let (origin, mut heads) = origin_http1(None).await;

    let mut client = TcpStream::connect(harness.proxy).await.unwrap();
    let request = format!(
        "POST http://{origin}/upload?x=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\n\
         User-Agent: it/1.0\r\nContent-Length: 5\r\n\r\nhello"
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_to_end(client).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hello from origin"));

    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("POST /upload?x=1 HTTP/1.1\r\n"));
    assert!(!head.to_ascii_lowercase().contains("proxy-connection"));

    let session = harness.finished_session(|s| s.method == "POST").await;
    assert_eq!(session.uri, "/upload?x=1");
    assert_eq!(session.state, 200);
    assert_eq!(session.upload_bytes, 5);
    assert_eq!(session.download_bytes, ORIGIN_BODY.len() as u64);
    assert_eq!(session.user_agent.as_deref(), Some("it/1.0"));
    assert_eq!(session.content_type.as_deref(), Some("text/plain"));
    assert!(!session.is_tls);

    let captured = std::fs::read(harness.capture.join(session.response_body_file())).unwrap();
    assert_eq!(captured, ORIGIN_BODY);
    let sent = std::fs::read(harness.capture.join(session.request_body_file())).unwrap();
    assert_eq!(sent, b"hello");

    harness.server.stop().await;
}

#[tokio::test]
async fn tunnel_without_interception_copies_bytes() {
    let harness = Harness::start(TaskConfig::default().with_intercept_tls(false)).await;

    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let mut client = harness.connect(origin).await;
    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"ping");
    client.shutdown().await.unwrap();
    drop(client);

    let session = harness.finished_session(|s| s.method == "CONNECT").await;
    assert_eq!(session.protocol, Protocol::Tunnel);
    assert_eq!(session.host, "127.0.0.1");
    assert!(session.is_tls);
    assert_eq!((session.upload_bytes, session.download_bytes), (4, 4));
    assert!(session.connected_time.is_some());

    harness.server.stop().await;
}

#[tokio::test]
async fn intercepted_http1_over_tls() {
    let harness = Harness::start(TaskConfig::default()).await;
    let (origin, mut heads) = origin_http1(Some(harness.origin_tls())).await;

    let tunnel = harness.connect(origin).await;
    let name = ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = harness.client_tls(&[ALPN_HTTP1]).connect(name, tunnel).await.unwrap();
    let request = format!("GET /secret HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();
    let response = read_to_end(tls).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hello from origin"));
    assert!(heads.recv().await.unwrap().starts_with("GET /secret HTTP/1.1\r\n"));

    let session = harness.finished_session(|s| s.uri == "/secret").await;
    assert_eq!(session.method, "GET");
    assert_eq!(session.protocol, Protocol::Http1);
    assert!(session.is_tls);
    assert!(session.handshake_end_time.is_some());
    assert_eq!(session.download_bytes, ORIGIN_BODY.len() as u64);

    harness.server.stop().await;
}

#[tokio::test]
async fn intercepted_h2_falls_back_to_http1_origin() {
    let harness = Harness::start(TaskConfig::default()).await;
    let (origin, mut heads) = origin_http1(Some(harness.origin_tls())).await;

    let tunnel = harness.connect(origin).await;
    let name = ServerName::try_from("127.0.0.1").unwrap();
    let tls = harness
        .client_tls(&[ALPN_H2, ALPN_HTTP1])
        .connect(name, tunnel)
        .await
        .unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(ALPN_H2));

    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = http::Request::builder()
        .uri(format!("https://{origin}/h2/stream"))
        .header("user-agent", "h2-client")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], ORIGIN_BODY);

    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("GET /h2/stream HTTP/1.1\r\n"));
    assert!(head.to_ascii_lowercase().contains("host: 127.0.0.1"));

    let session = harness.finished_session(|s| s.uri == "/h2/stream").await;
    assert_eq!(session.protocol, Protocol::H2);
    assert_eq!(session.state, 200);
    assert_eq!(session.user_agent.as_deref(), Some("h2-client"));
    assert_eq!(session.download_bytes, ORIGIN_BODY.len() as u64);

    drop(sender);
    harness.server.stop().await;
}

#[tokio::test]
async fn direct_strategy_skips_matching_hosts() {
    let config = TaskConfig::default()
        .with_strategy(DefaultStrategy::Direct)
        .with_rule(HostRule::new("127.0.0.1"));
    let harness = Harness::start(config).await;
    let (origin, _heads) = origin_http1(None).await;

    let mut client = TcpStream::connect(harness.proxy).await.unwrap();
    let request = format!("GET http://{origin}/skipped HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_to_end(client).await;
    assert!(response.ends_with("hello from origin"));

    assert!(harness.settled_sessions().await.is_empty());
    assert!(!harness.capture.exists() || std::fs::read_dir(&harness.capture).unwrap().next().is_none());

    harness.server.stop().await;
}

#[tokio::test]
async fn copy_strategy_records_matching_hosts() {
    let config = TaskConfig::default()
        .with_strategy(DefaultStrategy::Copy)
        .with_rule(HostRule::new("127.0.0.1"));
    let harness = Harness::start(config).await;
    let (origin, _heads) = origin_http1(None).await;

    let mut client = TcpStream::connect(harness.proxy).await.unwrap();
    let request = format!("GET http://{origin}/kept HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    read_to_end(client).await;

    let session = harness.finished_session(|s| s.uri == "/kept").await;
    assert!(!session.ignore);
    assert!(harness.capture.join(session.response_body_file()).exists());

    harness.server.stop().await;
}
