//! Per-socket driver.
//!
//! Every accepted socket is owned by one [`Connection`], which moves an
//! explicit [`ConnState`] through a single dispatch loop. Each state handler
//! takes the socket by value and returns the next state, so exactly one
//! stage owns the client at any time.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use crate::context::ConnectionContext;
use crate::io::BoxIo;
use crate::sniff::{sniff, Sniff, MAX_SNIFF_LEN};
use crate::task::Task;
use crate::{h2, mitm, plain, tunnel};

/// Where a connection is in its lifecycle.
pub(crate) enum ConnState {
    /// Reading the first bytes to pick a pipeline.
    Sniffing { io: BoxIo },
    /// HTTP/1 request/response, over TCP or inside intercepted TLS.
    PlainHttp {
        io: BoxIo,
        leftover: BytesMut,
        tls: bool,
    },
    /// Reading a CONNECT head.
    Negotiating { io: BoxIo, leftover: BytesMut },
    /// CONNECT acknowledged, waiting for the client to speak.
    AwaitingClientHello { io: BoxIo, leftover: BytesMut },
    /// Terminating the client's TLS with a minted certificate.
    Handshaking { io: BoxIo, hello: BytesMut },
    /// Blind byte relay to the origin.
    Tunneling { io: BoxIo, leftover: BytesMut },
    /// HTTP/2 inside intercepted TLS.
    Http2 { io: BoxIo },
    Done,
    Failed(String),
}

impl ConnState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ConnState::Sniffing { .. } => "sniffing",
            ConnState::PlainHttp { .. } => "plain-http",
            ConnState::Negotiating { .. } => "negotiating",
            ConnState::AwaitingClientHello { .. } => "awaiting-client-hello",
            ConnState::Handshaking { .. } => "handshaking",
            ConnState::Tunneling { .. } => "tunneling",
            ConnState::Http2 { .. } => "http2",
            ConnState::Done => "done",
            ConnState::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Debug for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Failed(note) => f.debug_tuple("Failed").field(note).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// One accepted client socket.
pub struct Connection {
    ctx: ConnectionContext,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(task: Arc<Task>, peer: Option<SocketAddr>) -> Self {
        Self {
            ctx: ConnectionContext::new(task),
            peer,
        }
    }

    /// Drives the socket to completion. Never fails: whatever goes wrong
    /// ends up as a note on the session.
    pub async fn run<T>(mut self, io: T)
    where
        T: crate::io::Io + 'static,
    {
        let ctx = &mut self.ctx;
        let mut state = ConnState::Sniffing { io: Box::new(io) };

        loop {
            tracing::trace!(session = %ctx.session().id, peer = ?self.peer, state = state.name(), "connection state");
            state = match state {
                ConnState::Sniffing { io } => sniff_protocol(ctx, io).await,
                ConnState::PlainHttp { io, leftover, tls } => plain::serve(ctx, io, leftover, tls).await,
                ConnState::Negotiating { io, leftover } => tunnel::negotiate(ctx, io, leftover).await,
                ConnState::AwaitingClientHello { io, leftover } => {
                    mitm::await_client_hello(ctx, io, leftover).await
                }
                ConnState::Handshaking { io, hello } => mitm::handshake(ctx, io, hello).await,
                ConnState::Tunneling { io, leftover } => tunnel::serve(ctx, io, leftover).await,
                ConnState::Http2 { io } => h2::serve(ctx, io).await,
                ConnState::Done => break,
                ConnState::Failed(note) => {
                    ctx.fail(note);
                    break;
                }
            };
        }

        ctx.finish();
    }
}

/// Reads until the first bytes identify a pipeline. Nothing is consumed:
/// the bytes read travel on as the next stage's leftover.
async fn sniff_protocol(ctx: &mut ConnectionContext, mut io: BoxIo) -> ConnState {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match sniff(&buf) {
            Sniff::Connect => return ConnState::Negotiating { io, leftover: buf },
            Sniff::Http => {
                return ConnState::PlainHttp {
                    io,
                    leftover: buf,
                    tls: false,
                }
            }
            Sniff::Tls => return ConnState::Handshaking { io, hello: buf },
            Sniff::Unknown => return ConnState::Failed("unrecognized protocol".into()),
            Sniff::Incomplete if buf.len() >= MAX_SNIFF_LEN => {
                return ConnState::Failed("unrecognized protocol".into())
            }
            Sniff::Incomplete => {}
        }

        match io.read_buf(&mut buf).await {
            Ok(0) if buf.is_empty() => {
                // Port probes and idle keep-alive sockets are not traffic.
                ctx.session_mut().ignore = true;
                return ConnState::Done;
            }
            Ok(0) => return ConnState::Failed("client closed before a request".into()),
            Ok(_) => {}
            Err(e) => return ConnState::Failed(format!("client read failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::tests::test_authority;
    use crate::tunnel::CONNECT_ESTABLISHED;
    use sluice_core::{MemoryStore, TaskConfig};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn task_with_store(config: TaskConfig) -> (tempfile::TempDir, Arc<Task>, Arc<MemoryStore>) {
        let (dir, authority) = test_authority();
        let store = Arc::new(MemoryStore::new());
        let task = Task::builder(config)
            .authority(authority)
            .store(store.clone())
            .capture_dir(None)
            .build()
            .unwrap();
        (dir, task, store)
    }

    #[tokio::test]
    async fn unknown_bytes_close_with_note() {
        let (_dir, task, store) = task_with_store(TaskConfig::default());
        let (mut client, proxy_side) = tokio::io::duplex(1024);
        client.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();

        Connection::new(task.clone(), None).run(proxy_side).await;
        task.recorder().flush().await;

        let sessions = store.all();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].note.as_deref(), Some("unrecognized protocol"));
        assert!(sessions[0].end_time.is_some());
    }

    #[tokio::test]
    async fn silent_close_is_not_recorded() {
        let (_dir, task, store) = task_with_store(TaskConfig::default());
        let (client, proxy_side) = tokio::io::duplex(1024);
        drop(client);

        Connection::new(task.clone(), None).run(proxy_side).await;
        task.recorder().flush().await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_client_hello_times_out() {
        let (_dir, task, store) = task_with_store(TaskConfig::default());
        let (mut client, proxy_side) = tokio::io::duplex(4096);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        Connection::new(task.clone(), None).run(proxy_side).await;
        assert!(started.elapsed() >= Duration::from_secs(10));

        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CONNECT_ESTABLISHED);
        // Exactly one acknowledgement, then EOF.
        assert_eq!(client.read(&mut [0u8; 16]).await.unwrap(), 0);

        task.recorder().flush().await;
        let session = &store.all()[0];
        assert_eq!(session.note.as_deref(), Some("no client hello received"));
        assert_eq!(session.host, "example.com");
    }
}
