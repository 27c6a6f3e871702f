//! Sluice Proxy - on-device TLS-intercepting HTTP proxy.
//!
//! Every accepted socket is sniffed and routed to one of three pipelines:
//! plain HTTP, a CONNECT tunnel, or a bare TLS handshake. CONNECT tunnels to
//! hosts that are not ignored are re-terminated with a certificate minted
//! on the fly by a local root CA, so the HTTP inside can be recorded.
//!
//! ## Architecture
//!
//! ```text
//! accept → sniff ─┬─ CONNECT ─→ 200 Established ─→ first byte ─┬─ intercept ─→ TLS accept ─┬─ http/1.1 ─→ exchange
//!                 │                                             │                            └─ h2 ───────→ hyper streams
//!                 │                                             └─ ignore ────→ raw tunnel
//!                 ├─ HTTP ────→ exchange
//!                 └─ TLS ─────→ SNI ─→ (as above)
//! ```
//!
//! Each flow is recorded as a [`sluice_core::Session`], persisted through a
//! [`sluice_core::SessionStore`], with bodies optionally captured to disk.

mod authority;
mod ca;
mod capture;
mod codec;
mod connection;
mod context;
mod error;
mod h2;
mod io;
mod listener;
mod mitm;
mod pending;
mod plain;
mod recorder;
mod relay;
mod sniff;
mod task;
mod tunnel;

pub use authority::{crypto_provider, CertificateAuthority, LeafCert, ALPN_H2, ALPN_HTTP1};
pub use ca::{CaBundle, CaManager};
pub use capture::{BodyCapture, ExchangeCapture};
pub use codec::{BodyKind, Frame, MessageHead, RequestDecoder, RequestHead, ResponseDecoder, ResponseHead};
pub use connection::Connection;
pub use context::ConnectionContext;
pub use error::{CaManagerError, ExchangeError, ListenerError, ProxyError, Result};
pub use io::{BoxIo, Io, Replay};
pub use listener::{ListenerStatus, ProxyServer};
pub use recorder::SessionRecorder;
pub use sniff::{sniff, Sniff};
pub use task::{Task, TaskBuilder, TrafficCounters};
pub use tunnel::CONNECT_ESTABLISHED;
