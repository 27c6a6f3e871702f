//! TLS re-termination.
//!
//! After a CONNECT is acknowledged the client gets a bounded wait to start
//! talking. When the tunnel is intercepted its ClientHello is buffered, the
//! server name is read out of it and the replayed bytes are handed to a TLS
//! acceptor presenting a certificate minted for the target. A second bounded
//! wait covers the whole handshake.

use std::io;

use bytes::BytesMut;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsAcceptor;

use sluice_core::request::HTTPS_PORT;
use sluice_core::{NetRequest, Protocol};

use crate::authority::ALPN_H2;
use crate::connection::ConnState;
use crate::context::ConnectionContext;
use crate::io::{BoxIo, Replay};
use crate::sniff::{client_hello_sni, looks_like_client_hello, tls_record_len};

/// Waits for the first byte after the CONNECT acknowledgement, then picks
/// interception or a raw tunnel.
pub(crate) async fn await_client_hello(
    ctx: &mut ConnectionContext,
    mut io: BoxIo,
    mut leftover: BytesMut,
) -> ConnState {
    let deadline = ctx.task().client_hello_timeout();
    let first_byte = tokio::time::timeout(deadline, async {
        while leftover.is_empty() {
            if io.read_buf(&mut leftover).await? == 0 {
                return Ok(false);
            }
        }
        Ok::<_, io::Error>(true)
    })
    .await;

    match first_byte {
        Err(_) => ConnState::Failed("no client hello received".into()),
        Ok(Err(e)) => ConnState::Failed(format!("client read failed: {e}")),
        Ok(Ok(false)) => ConnState::Failed("client closed before sending data".into()),
        Ok(Ok(true)) => {
            if ctx.task().intercepts_tls() && !ctx.session().ignore {
                ConnState::Handshaking {
                    io,
                    hello: leftover,
                }
            } else {
                ConnState::Tunneling { io, leftover }
            }
        }
    }
}

/// Terminates the client's TLS session under the handshake deadline.
pub(crate) async fn handshake(ctx: &mut ConnectionContext, io: BoxIo, hello: BytesMut) -> ConnState {
    let deadline = ctx.task().handshake_timeout();
    match tokio::time::timeout(deadline, intercept(ctx, io, hello)).await {
        Ok(state) => state,
        Err(_) => ConnState::Failed("no server hello from interceptor".into()),
    }
}

async fn intercept(ctx: &mut ConnectionContext, mut io: BoxIo, mut hello: BytesMut) -> ConnState {
    loop {
        if hello.len() >= 3 && !looks_like_client_hello(&hello) {
            return ConnState::Failed("first bytes are not a TLS client hello".into());
        }
        if tls_record_len(&hello).is_some_and(|len| hello.len() >= len) {
            break;
        }
        match io.read_buf(&mut hello).await {
            Ok(0) => return ConnState::Failed("client closed during TLS handshake".into()),
            Ok(_) => {}
            Err(e) => return ConnState::Failed(format!("client read failed: {e}")),
        }
    }

    let sni = client_hello_sni(&hello);
    ctx.session_mut().sni = sni.clone();
    let task = ctx.task().clone();

    if ctx.request().is_none() {
        // TLS without CONNECT: the server name is the only way to the origin.
        let Some(name) = sni.clone() else {
            return ConnState::Failed("TLS without CONNECT and without a server name".into());
        };
        let request = NetRequest::new(name, HTTPS_PORT, true);
        let ignore = task.resolve_ignore(request.host(), "", "");
        ctx.set_request(request);
        {
            let session = ctx.session_mut();
            session.protocol = Protocol::Tunnel;
            session.ignore = ignore;
        }
        ctx.persist();

        if !task.intercepts_tls() || ignore {
            return ConnState::Tunneling { io, leftover: hello };
        }
    }

    let Some(request) = ctx.request().cloned() else {
        return ConnState::Failed("no target for TLS interception".into());
    };
    let cert_host = match &sni {
        Some(name) if task.config().prefer_sni => name.clone(),
        _ => request.host().to_string(),
    };

    let config = match task.server_config(&cert_host) {
        Ok(config) => config,
        Err(e) => return ConnState::Failed(format!("certificate for {cert_host} failed: {e}")),
    };

    let tls = match TlsAcceptor::from(config).accept(Replay::new(hello.freeze(), io)).await {
        Ok(tls) => tls,
        Err(e) => return ConnState::Failed(format!("TLS handshake with client failed: {e}")),
    };

    let h2 = tls.get_ref().1.alpn_protocol() == Some(ALPN_H2);
    {
        let session = ctx.session_mut();
        session.handshake_end_time = Some(Utc::now());
        session.protocol = if h2 { Protocol::H2 } else { Protocol::Http1 };
    }
    ctx.persist();
    tracing::debug!(session = %ctx.session().id, host = %cert_host, h2, "intercepted TLS");

    if h2 {
        ConnState::Http2 { io: Box::new(tls) }
    } else {
        ConnState::PlainHttp {
            io: Box::new(tls),
            leftover: BytesMut::new(),
            tls: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::tests::client_hello;
    use crate::task::tests::test_task;
    use sluice_core::TaskConfig;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test(start_paused = true)]
    async fn first_byte_before_deadline_proceeds() {
        let (_dir, task) = test_task(TaskConfig::default());
        let mut ctx = ConnectionContext::new(task);
        ctx.set_request(NetRequest::new("example.com", 443, true));

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(9_900)).await;
            client.write_all(&[0x16]).await.unwrap();
            client
        });

        let state = await_client_hello(&mut ctx, Box::new(proxy_side), BytesMut::new()).await;
        assert!(matches!(state, ConnState::Handshaking { .. }));
        drop(writer.await.unwrap());
        ctx.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_deadline_closes() {
        let (_dir, task) = test_task(TaskConfig::default());
        let mut ctx = ConnectionContext::new(task);
        ctx.set_request(NetRequest::new("example.com", 443, true));

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10_100)).await;
            let _ = client.write_all(&[0x16]).await;
        });

        let state = await_client_hello(&mut ctx, Box::new(proxy_side), BytesMut::new()).await;
        let ConnState::Failed(note) = state else {
            panic!("expected failure");
        };
        assert_eq!(note, "no client hello received");
        writer.await.unwrap();
        ctx.finish();
    }

    #[tokio::test]
    async fn ignored_tunnel_is_relayed_raw() {
        let (_dir, task) = test_task(TaskConfig::default());
        let mut ctx = ConnectionContext::new(task);
        ctx.set_request(NetRequest::new("example.com", 443, true));
        ctx.session_mut().ignore = true;

        let (_client, proxy_side) = tokio::io::duplex(1024);
        let state = await_client_hello(&mut ctx, Box::new(proxy_side), BytesMut::from(&b"\x16"[..])).await;
        assert!(matches!(state, ConnState::Tunneling { .. }));
        ctx.finish();
    }

    #[tokio::test]
    async fn non_tls_bytes_abort_interception() {
        let (_dir, task) = test_task(TaskConfig::default());
        let mut ctx = ConnectionContext::new(task);
        ctx.set_request(NetRequest::new("example.com", 443, true));

        let (_client, proxy_side) = tokio::io::duplex(1024);
        let state = handshake(&mut ctx, Box::new(proxy_side), BytesMut::from(&b"GET / HTTP/1.1\r\n"[..])).await;
        assert!(matches!(state, ConnState::Failed(_)));
        ctx.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out() {
        let (_dir, task) = test_task(TaskConfig::default());
        let mut ctx = ConnectionContext::new(task);
        ctx.set_request(NetRequest::new("example.com", 443, true));

        let hello = client_hello("example.com");
        let partial = BytesMut::from(&hello[..hello.len() / 2]);
        let (_client, proxy_side) = tokio::io::duplex(1024);

        let ConnState::Failed(note) = handshake(&mut ctx, Box::new(proxy_side), partial).await else {
            panic!("expected failure");
        };
        assert_eq!(note, "no server hello from interceptor");
        assert!(ctx.session().sni.is_none());
        ctx.finish();
    }

    #[tokio::test]
    async fn raw_tls_without_interception_tunnels_to_sni() {
        let (_dir, authority) = crate::authority::tests::test_authority();
        let task = crate::task::Task::builder(TaskConfig::default().with_intercept_tls(false))
            .authority(authority)
            .capture_dir(None)
            .build()
            .unwrap();
        let mut ctx = ConnectionContext::new(task);

        let hello = BytesMut::from(&client_hello("api.example.com")[..]);
        let (_client, proxy_side) = tokio::io::duplex(1024);
        let state = handshake(&mut ctx, Box::new(proxy_side), hello).await;

        assert!(matches!(state, ConnState::Tunneling { .. }));
        let request = ctx.request().unwrap();
        assert_eq!((request.host(), request.port()), ("api.example.com", 443));
        assert_eq!(ctx.session().sni.as_deref(), Some("api.example.com"));
        ctx.finish();
    }

    #[tokio::test]
    async fn raw_tls_without_sni_fails() {
        let (_dir, task) = test_task(TaskConfig::default());
        let mut ctx = ConnectionContext::new(task);

        let mut hello = client_hello("x");
        // Break the extension type so no server name is found.
        let pos = hello.len() - 10;
        hello[pos] = 0xff;
        let (_client, proxy_side) = tokio::io::duplex(1024);
        let state = handshake(&mut ctx, Box::new(proxy_side), BytesMut::from(&hello[..])).await;
        assert!(matches!(state, ConnState::Failed(_)));
        ctx.finish();
    }
}
