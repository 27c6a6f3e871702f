//! CONNECT negotiation and the raw tunnel relay.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use chrono::Utc;
use http::header::USER_AGENT;
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sluice_core::{NetRequest, Protocol};

use crate::codec::{header_pairs, Frame, RequestDecoder};
use crate::connection::ConnState;
use crate::context::ConnectionContext;
use crate::io::BoxIo;

/// The one response a CONNECT ever gets.
pub const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nContent-Length: 0\r\n\r\n";

/// Client bytes held while the origin connection is set up.
const MAX_EARLY_DATA: usize = 64 * 1024;

const PUMP_BUFFER: usize = 16 * 1024;

/// Reads the CONNECT head, records the target and acknowledges the tunnel.
pub(crate) async fn negotiate(
    ctx: &mut ConnectionContext,
    mut io: BoxIo,
    leftover: BytesMut,
) -> ConnState {
    let mut decoder = RequestDecoder::with_buffer(leftover);
    let head = match decoder.next_frame(&mut io).await {
        Ok(Some(Frame::Head(head))) => head,
        Ok(_) => return ConnState::Failed("client closed before CONNECT completed".into()),
        Err(e) => return ConnState::Failed(format!("bad CONNECT request: {e}")),
    };
    if head.method != Method::CONNECT {
        return ConnState::Failed(format!("expected CONNECT, got {}", head.method));
    }

    let request = match NetRequest::from_authority(&head.uri, true) {
        Ok(request) => request,
        Err(e) => return ConnState::Failed(e.to_string()),
    };
    ctx.set_request(request.clone());

    let user_agent = head.header(USER_AGENT.as_str()).unwrap_or_default().to_string();
    let ignore = ctx.task().resolve_ignore(request.host(), "", &user_agent);
    {
        let session = ctx.session_mut();
        session.method = Method::CONNECT.to_string();
        session.uri = head.uri.clone();
        session.req_headers = header_pairs(&head.headers);
        session.user_agent = Some(user_agent).filter(|ua| !ua.is_empty());
        session.protocol = Protocol::Tunnel;
        session.ignore = ignore;
    }
    ctx.persist();

    if let Err(e) = acknowledge(&mut io).await {
        return ConnState::Failed(format!("client write failed: {e}"));
    }
    tracing::debug!(session = %ctx.session().id, origin = %request, ignore, "tunnel established");

    // The decoder is parked after the CONNECT head; anything it holds
    // belongs to the tunnel.
    ConnState::AwaitingClientHello {
        io,
        leftover: decoder.into_buffer(),
    }
}

async fn acknowledge(io: &mut BoxIo) -> io::Result<()> {
    io.write_all(CONNECT_ESTABLISHED).await?;
    io.flush().await
}

/// Connects to the CONNECT target and copies bytes both ways until either
/// side closes.
pub(crate) async fn serve(
    ctx: &mut ConnectionContext,
    mut downstream: BoxIo,
    mut early: BytesMut,
) -> ConnState {
    let Some(request) = ctx.request().cloned() else {
        return ConnState::Failed("tunnel without a target".into());
    };
    let task = ctx.task().clone();

    ctx.session_mut().connect_time = Some(Utc::now());
    ctx.persist();

    let connect = task.connect_upstream(&request);
    tokio::pin!(connect);
    let mut client_closed = false;
    let connected = loop {
        tokio::select! {
            biased;
            result = &mut connect => break result,
            read = downstream.read_buf(&mut early), if !client_closed && early.len() < MAX_EARLY_DATA => match read {
                Ok(0) => client_closed = true,
                Ok(_) => {}
                Err(e) => return ConnState::Failed(format!("client read failed: {e}")),
            },
        }
    };

    let (mut upstream, addr) = match connected {
        Ok(connected) => connected,
        Err(e) => return ConnState::Failed(format!("upstream connect failed: {e}")),
    };
    {
        let session = ctx.session_mut();
        session.connected_time = Some(Utc::now());
        session.target = Some(addr.to_string());
    }
    ctx.persist();

    if !early.is_empty() {
        if let Err(e) = upstream.write_all(&early).await {
            return ConnState::Failed(format!("upstream write failed: {e}"));
        }
        ctx.add_upload(early.len() as u64);
    }
    if client_closed {
        ctx.close_linked(&mut downstream, &mut upstream).await;
        return ConnState::Done;
    }

    relay(ctx, downstream, Box::new(upstream)).await;
    ConnState::Done
}

/// Copies bytes between two streams until either side closes, then closes
/// both. Bytes are counted into the task as they flow and into the session
/// at the end.
pub(crate) async fn relay(ctx: &mut ConnectionContext, downstream: BoxIo, upstream: BoxIo) {
    let task = ctx.task().clone();
    let uploaded = AtomicU64::new(0);
    let downloaded = AtomicU64::new(0);

    let (mut down_r, mut down_w) = tokio::io::split(downstream);
    let (mut up_r, mut up_w) = tokio::io::split(upstream);

    let outcome = tokio::select! {
        result = pump(&mut down_r, &mut up_w, &uploaded, |n| task.counters().add_upload(n)) => result,
        result = pump(&mut up_r, &mut down_w, &downloaded, |n| task.counters().add_download(n)) => result,
    };

    ctx.close_linked(&mut down_w, &mut up_w).await;

    let session = ctx.session_mut();
    session.upload_bytes += uploaded.load(Ordering::Relaxed);
    session.download_bytes += downloaded.load(Ordering::Relaxed);
    if let Err(e) = outcome {
        tracing::debug!(session = %session.id, "tunnel closed: {}", e);
    }
}

async fn pump<R, W, F>(reader: &mut R, writer: &mut W, counted: &AtomicU64, mut on_bytes: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counted.fetch_add(n as u64, Ordering::Relaxed);
        on_bytes(n as u64);
        writer.flush().await?;
    }
}
