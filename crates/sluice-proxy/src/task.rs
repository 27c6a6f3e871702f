//! One running proxy instance.
//!
//! A [`Task`] is shared by every connection a [`ProxyServer`](crate::ProxyServer)
//! accepts. It holds the configuration, the certificate authority, the rule
//! predicate, the session recorder and the running byte counters. Nothing in
//! it outlives a restart of the process.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use sluice_core::{CoreError, NetRequest, Notifier, NullStore, RulePredicate, SessionStore, TaskConfig};

use crate::authority::{crypto_provider, CertificateAuthority, ALPN_H2, ALPN_HTTP1};
use crate::error::{ProxyError, Result};
use crate::recorder::SessionRecorder;

/// Byte and connection totals for the whole task.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    upload: AtomicU64,
    download: AtomicU64,
    connections: AtomicU64,
}

impl TrafficCounters {
    pub fn add_upload(&self, n: u64) {
        self.upload.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_download(&self, n: u64) {
        self.download.fetch_add(n, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Shared state of a running proxy.
pub struct Task {
    config: TaskConfig,
    authority: Option<Arc<CertificateAuthority>>,
    predicate: Arc<dyn RulePredicate>,
    recorder: SessionRecorder,
    notifier: Notifier,
    connector: TlsConnector,
    connector_h2: TlsConnector,
    capture_dir: Option<PathBuf>,
    counters: TrafficCounters,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("config", &self.config)
            .field("authority", &self.authority)
            .field("capture_dir", &self.capture_dir)
            .field("counters", &self.counters)
            .finish()
    }
}

impl Task {
    pub fn builder(config: TaskConfig) -> TaskBuilder {
        TaskBuilder::new(config)
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn authority(&self) -> Option<&Arc<CertificateAuthority>> {
        self.authority.as_ref()
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    /// Where bodies are captured, if anywhere.
    pub fn capture_dir(&self) -> Option<&Path> {
        self.capture_dir.as_deref()
    }

    /// Whether CONNECT tunnels are intercepted at all.
    pub fn intercepts_tls(&self) -> bool {
        self.config.intercept_tls && self.authority.is_some()
    }

    pub fn client_hello_timeout(&self) -> Duration {
        self.config.client_hello_timeout()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout()
    }

    /// Decides whether an exchange is ignored: the rule predicate's answer,
    /// inverted under the `Copy` strategy.
    pub fn resolve_ignore(&self, host: &str, uri: &str, user_agent: &str) -> bool {
        self.config
            .default_strategy
            .ignore(self.predicate.as_ref(), host, uri, user_agent)
    }

    /// Server-side TLS settings presenting a certificate for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let authority = self.authority.as_ref().ok_or_else(|| {
            CoreError::Config("TLS interception needs a certificate authority".into())
        })?;
        let leaf = authority.leaf_for(host)?;
        if self.config.http2 {
            authority.server_config(&leaf, &[ALPN_H2, ALPN_HTTP1])
        } else {
            authority.server_config(&leaf, &[ALPN_HTTP1])
        }
    }

    /// Opens a TCP connection to the origin.
    pub async fn connect_upstream(&self, request: &NetRequest) -> io::Result<(TcpStream, SocketAddr)> {
        let stream = TcpStream::connect((request.host(), request.port())).await?;
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;
        tracing::debug!(origin = %request, %addr, "connected upstream");
        Ok((stream, addr))
    }

    /// Runs the client side of a TLS handshake with the origin.
    ///
    /// Certificates are validated against the task's roots. Host names are
    /// checked for DNS names and skipped for IP literals.
    pub async fn connect_tls(
        &self,
        stream: TcpStream,
        host: &str,
        offer_h2: bool,
    ) -> io::Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let connector = if offer_h2 {
            &self.connector_h2
        } else {
            &self.connector
        };
        connector.connect(name, stream).await
    }
}

/// Builder for [`Task`].
pub struct TaskBuilder {
    config: TaskConfig,
    authority: Option<Arc<CertificateAuthority>>,
    predicate: Option<Arc<dyn RulePredicate>>,
    store: Option<Arc<dyn SessionStore>>,
    notifier: Option<Notifier>,
    roots: Option<RootCertStore>,
    capture_dir: Option<PathBuf>,
}

impl TaskBuilder {
    pub fn new(config: TaskConfig) -> Self {
        let capture_dir = config.capture_dir.clone();
        Self {
            config,
            authority: None,
            predicate: None,
            store: None,
            notifier: None,
            roots: None,
            capture_dir,
        }
    }

    pub fn authority(mut self, authority: CertificateAuthority) -> Self {
        self.authority = Some(Arc::new(authority));
        self
    }

    /// Replaces the configured host rules with an arbitrary predicate.
    pub fn predicate(mut self, predicate: impl RulePredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Trust roots for origin certificates. Defaults to the Mozilla set.
    pub fn roots(mut self, roots: RootCertStore) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Overrides the capture directory; `None` turns capture off.
    pub fn capture_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.capture_dir = dir;
        self
    }

    pub fn build(self) -> Result<Arc<Task>> {
        self.config.validate()?;

        if self.config.intercept_tls && self.authority.is_none() {
            return Err(ProxyError::Core(CoreError::Config(
                "TLS interception needs a certificate authority".into(),
            )));
        }

        let roots = Arc::new(self.roots.unwrap_or_else(|| RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        }));
        let verifier = Arc::new(OriginVerifier::new(roots)?);

        let predicate: Arc<dyn RulePredicate> = match self.predicate {
            Some(predicate) => predicate,
            None => Arc::new(self.config.rules.clone()),
        };

        Ok(Arc::new(Task {
            connector: TlsConnector::from(client_config(verifier.clone(), &[ALPN_HTTP1])?),
            connector_h2: TlsConnector::from(client_config(verifier, &[ALPN_H2, ALPN_HTTP1])?),
            authority: self.authority,
            predicate,
            recorder: SessionRecorder::new(self.store.unwrap_or_else(|| Arc::new(NullStore))),
            notifier: self.notifier.unwrap_or_default(),
            capture_dir: self.capture_dir,
            counters: TrafficCounters::default(),
            config: self.config,
        }))
    }
}

fn client_config(verifier: Arc<OriginVerifier>, alpn: &[&[u8]]) -> Result<Arc<ClientConfig>> {
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// WebPKI verification, minus the name check for IP-literal origins.
#[derive(Debug)]
struct OriginVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    roots: Arc<RootCertStore>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl OriginVerifier {
    fn new(roots: Arc<RootCertStore>) -> Result<Self> {
        let provider = crypto_provider();
        let webpki = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        Ok(Self {
            webpki,
            roots,
            algorithms: provider.signature_verification_algorithms,
        })
    }
}

impl ServerCertVerifier for OriginVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let ServerName::IpAddress(_) = server_name {
            let cert = ParsedCertificate::try_from(end_entity)?;
            rustls::client::verify_server_cert_signed_by_trust_anchor(
                &cert,
                &self.roots,
                intermediates,
                now,
                self.algorithms.all,
            )?;
            return Ok(ServerCertVerified::assertion());
        }
        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::authority::tests::test_authority;
    use sluice_core::{DefaultStrategy, HostRule};
    use tempfile::TempDir;

    /// A task with interception enabled and no capture directory.
    pub(crate) fn test_task(config: TaskConfig) -> (TempDir, Arc<Task>) {
        let (dir, authority) = test_authority();
        let task = Task::builder(config)
            .authority(authority)
            .capture_dir(None)
            .build()
            .unwrap();
        (dir, task)
    }

    #[test]
    fn interception_requires_authority() {
        let err = Task::builder(TaskConfig::default()).build().unwrap_err();
        assert!(err.to_string().contains("certificate authority"));

        let task = Task::builder(TaskConfig::default().with_intercept_tls(false))
            .build()
            .unwrap();
        assert!(!task.intercepts_tls());
    }

    #[test]
    fn direct_strategy_ignores_matches() {
        let config = TaskConfig::default().with_rule(HostRule::new("*.example.com"));
        let (_dir, task) = test_task(config);

        assert!(task.resolve_ignore("api.example.com", "/", ""));
        assert!(!task.resolve_ignore("other.org", "/", ""));
    }

    #[test]
    fn copy_strategy_captures_only_matches() {
        let config = TaskConfig::default()
            .with_strategy(DefaultStrategy::Copy)
            .with_rule(HostRule::new("*.example.com"));
        let (_dir, task) = test_task(config);

        assert!(!task.resolve_ignore("api.example.com", "/", ""));
        assert!(task.resolve_ignore("other.org", "/", ""));
    }

    #[test]
    fn custom_predicate_replaces_rules() {
        let (_dir, authority) = test_authority();
        let task = Task::builder(TaskConfig::default())
            .authority(authority)
            .predicate(|_: &str, uri: &str, _: &str| uri.starts_with("/private"))
            .build()
            .unwrap();

        assert!(task.resolve_ignore("a.com", "/private/x", ""));
        assert!(!task.resolve_ignore("a.com", "/public", ""));
    }

    #[test]
    fn server_config_follows_http2_flag() {
        let (_dir, task) = test_task(TaskConfig::default().with_http2(false));
        let config = task.server_config("example.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let (_dir, task) = test_task(TaskConfig::default());
        let config = task.server_config("example.com").unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
    }

    #[test]
    fn counters_accumulate() {
        let counters = TrafficCounters::default();
        counters.add_upload(1000);
        counters.add_download(2000);
        counters.connection_opened();
        assert_eq!(counters.upload(), 1000);
        assert_eq!(counters.download(), 2000);
        assert_eq!(counters.connections(), 1);
    }
}
