//! Plain-HTTP handling, also used for HTTP/1 inside intercepted TLS.

use std::io;

use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, USER_AGENT};
use http::{HeaderValue, Method};
use tokio::io::AsyncWriteExt;

use sluice_core::{origin_form, NetRequest, Protocol};

use crate::capture::ExchangeCapture;
use crate::codec::{header_pairs, Frame, RequestDecoder, RequestHead};
use crate::connection::ConnState;
use crate::context::ConnectionContext;
use crate::io::BoxIo;
use crate::relay::{Exchange, Upstream};

/// Request headers meant for the proxy, never forwarded.
const PROXY_HEADERS: &[&str] = &["proxy-authorization", "proxy-connection", "expect"];

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Reads one request head, resolves its origin and relays the exchange.
pub(crate) async fn serve(
    ctx: &mut ConnectionContext,
    mut io: BoxIo,
    leftover: BytesMut,
    tls: bool,
) -> ConnState {
    let mut decoder = RequestDecoder::with_buffer(leftover);
    let mut head = match decoder.next_frame(&mut io).await {
        Ok(Some(Frame::Head(head))) => head,
        Ok(None) => return ConnState::Done,
        Ok(Some(_)) => return ConnState::Failed("request body without a head".into()),
        Err(e) => {
            let _ = io.write_all(BAD_REQUEST).await;
            return ConnState::Failed(format!("bad request: {e}"));
        }
    };

    if head.method == Method::CONNECT {
        let _ = io.write_all(BAD_REQUEST).await;
        return ConnState::Failed("CONNECT on an established connection".into());
    }

    let request = match ctx.request() {
        Some(request) if tls => request.clone(),
        _ => match NetRequest::from_request(&head.uri, head.header(HOST.as_str()), tls) {
            Ok(request) => request,
            Err(e) => {
                let _ = io.write_all(BAD_REQUEST).await;
                return ConnState::Failed(e.to_string());
            }
        },
    };
    ctx.set_request(request.clone());

    let task = ctx.task().clone();
    let uri = origin_form(&head.uri, request.host());
    let user_agent = head.header(USER_AGENT.as_str()).unwrap_or_default().to_string();
    let ignore = task.resolve_ignore(request.host(), &uri, &user_agent);

    {
        let session = ctx.session_mut();
        session.host = request.host().to_string();
        session.is_tls = request.is_tls();
        session.method = head.method.to_string();
        session.uri = uri.clone();
        session.req_headers = header_pairs(&head.headers);
        session.user_agent = Some(user_agent).filter(|ua| !ua.is_empty());
        session.protocol = Protocol::Http1;
        session.ignore = ignore;
    }
    prepare_upstream_head(&mut head, &uri, &request);
    ctx.persist();

    tracing::debug!(
        session = %ctx.session().id,
        method = %head.method,
        origin = %request,
        uri = %uri,
        ignore,
        "http exchange"
    );

    let capture = ExchangeCapture::for_session(task.capture_dir(), ctx.session());
    let connect = async move {
        let (stream, addr) = task.connect_upstream(&request).await?;
        let upstream: BoxIo = if request.is_tls() {
            Box::new(task.connect_tls(stream, request.host(), false).await?)
        } else {
            Box::new(stream)
        };
        Ok::<_, io::Error>(Upstream::new(upstream, Some(addr)))
    };

    match Exchange::new(ctx, capture).run(io, decoder, head, connect).await {
        Ok(()) => ConnState::Done,
        Err(e) => ConnState::Failed(e.to_string()),
    }
}

/// Rewrites a client request head for the origin.
fn prepare_upstream_head(head: &mut RequestHead, uri: &str, request: &NetRequest) {
    head.uri = uri.to_string();

    for name in PROXY_HEADERS {
        head.headers.remove(*name);
    }
    if head.headers.contains_key(TRANSFER_ENCODING) {
        head.headers.remove(CONTENT_LENGTH);
    }
    if !head.headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&host_header(request)) {
            head.headers.insert(HOST, value);
        }
    }

    let connection = if head.is_upgrade() { "upgrade" } else { "close" };
    head.headers.insert(CONNECTION, HeaderValue::from_static(connection));
}

/// `Host` value for an origin, with the port only when it is not the default.
pub(crate) fn host_header(request: &NetRequest) -> String {
    if request.port() == NetRequest::default_port(request.is_tls()) {
        if request.host().contains(':') {
            format!("[{}]", request.host())
        } else {
            request.host().to_string()
        }
    } else {
        request.authority()
    }
}
