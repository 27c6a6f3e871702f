//! Error types for the proxy.

use std::net::SocketAddr;

use sluice_core::CoreError;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// Leaf certificate could not be minted.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Malformed HTTP message.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Request model or configuration error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Listener error.
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    /// A relayed exchange ended early.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Why a relayed exchange stopped. The message is what the session records
/// as its note.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("upstream connect failed: {0}")]
    Connect(std::io::Error),

    #[error("upstream TLS failed: {0}")]
    UpstreamTls(std::io::Error),

    #[error("upstream handshake failed: {0}")]
    Handshake(hyper::Error),

    #[error("upstream write failed: {0}")]
    UpstreamWrite(std::io::Error),

    #[error("client write failed: {0}")]
    ClientWrite(std::io::Error),

    #[error("bad request: {0}")]
    BadRequest(std::io::Error),

    #[error("bad response: {0}")]
    BadResponse(std::io::Error),

    #[error("client closed before upstream connected")]
    ClientClosedEarly,

    #[error("client closed mid-request")]
    ClientClosedMidRequest,

    #[error("upstream closed without a response")]
    NoResponse,
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate or keys.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA files.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate or key.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA files.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Listener bootstrap error type.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// No enabled listener could be started.
    #[error("no listener could be started")]
    NoListeners,

    /// The server is already running.
    #[error("proxy is already running")]
    AlreadyRunning,
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
