//! HTTP/2 inside intercepted TLS.
//!
//! Framing is left to hyper. The client connection is served with hyper's
//! HTTP/2 server and every stream is forwarded over one origin connection,
//! HTTP/2 when the origin agrees to it and HTTP/1.1 otherwise. Each stream
//! is its own session; body frames are counted and captured through a tee
//! on the way past.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, HOST, TE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::{http1 as client_http1, http2 as client_http2};
use hyper::server::conn::http2 as server_http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::mpsc;

use sluice_core::{NetRequest, Protocol};

use crate::authority::ALPN_H2;
use crate::capture::ExchangeCapture;
use crate::codec::header_pairs;
use crate::connection::ConnState;
use crate::context::ConnectionContext;
use crate::error::{ExchangeError, Result};
use crate::io::BoxIo;
use crate::plain::host_header;
use crate::task::Task;

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Connection-specific headers, which HTTP/2 forbids and which never
/// travel past a proxy anyway. `te` is handled separately.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "transfer-encoding",
    "upgrade",
    "expect",
];

/// Serves an intercepted HTTP/2 client until it goes away.
pub(crate) async fn serve(ctx: &mut ConnectionContext, io: BoxIo) -> ConnState {
    let Some(request) = ctx.request().cloned() else {
        return ConnState::Failed("h2 without a target".into());
    };
    let task = ctx.task().clone();

    ctx.session_mut().connect_time = Some(Utc::now());
    let sender = match connect(&task, &request).await {
        Ok((sender, addr)) => {
            let session = ctx.session_mut();
            session.connected_time = Some(Utc::now());
            session.target = Some(addr.to_string());
            sender
        }
        Err(e) => return ConnState::Failed(e.to_string()),
    };
    ctx.persist();

    let streams = Arc::new(AtomicU64::new(0));
    let proxy = StreamProxy {
        task,
        request,
        sender,
        template: StreamTemplate::from_session(ctx.session()),
        streams: streams.clone(),
    };
    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(proxy.handle(req).await) }
    });

    let served = server_http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await;

    let count = streams.load(Ordering::Relaxed);
    ctx.session_mut().add_note(format!("{count} h2 streams"));
    match served {
        Ok(()) => ConnState::Done,
        Err(e) => ConnState::Failed(format!("h2 connection failed: {e}")),
    }
}

/// Opens the origin connection, speaking whatever ALPN settled on.
async fn connect(task: &Arc<Task>, request: &NetRequest) -> Result<(UpstreamSender, std::net::SocketAddr)> {
    let (stream, addr) = task
        .connect_upstream(request)
        .await
        .map_err(ExchangeError::Connect)?;
    let tls = task
        .connect_tls(stream, request.host(), true)
        .await
        .map_err(ExchangeError::UpstreamTls)?;
    let h2 = tls.get_ref().1.alpn_protocol() == Some(ALPN_H2);
    let io = TokioIo::new(tls);

    let sender = if h2 {
        let (sender, conn) = client_http2::handshake(TokioExecutor::new(), io)
            .await
            .map_err(ExchangeError::Handshake)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("upstream h2 connection closed: {}", e);
            }
        });
        UpstreamSender::H2(sender)
    } else {
        let (sender, conn) = client_http1::handshake(io)
            .await
            .map_err(ExchangeError::Handshake)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("upstream http/1.1 connection closed: {}", e);
            }
        });
        UpstreamSender::H1(Arc::new(tokio::sync::Mutex::new(sender)))
    };
    tracing::debug!(origin = %request, h2, "h2 upstream ready");
    Ok((sender, addr))
}

/// The origin side of an h2 connection. HTTP/1.1 origins take one request
/// at a time.
#[derive(Clone)]
enum UpstreamSender {
    H2(client_http2::SendRequest<ProxyBody>),
    H1(Arc<tokio::sync::Mutex<client_http1::SendRequest<ProxyBody>>>),
}

impl UpstreamSender {
    fn is_h2(&self) -> bool {
        matches!(self, UpstreamSender::H2(_))
    }

    async fn send(&self, req: Request<ProxyBody>) -> hyper::Result<Response<Incoming>> {
        match self {
            UpstreamSender::H2(sender) => {
                let mut sender = sender.clone();
                sender.ready().await?;
                sender.send_request(req).await
            }
            UpstreamSender::H1(sender) => {
                let mut sender = sender.lock().await;
                sender.ready().await?;
                sender.send_request(req).await
            }
        }
    }
}

/// Connection-level fields every stream session inherits.
#[derive(Debug, Clone)]
struct StreamTemplate {
    sni: Option<String>,
    target: Option<String>,
    connect_time: Option<DateTime<Utc>>,
    connected_time: Option<DateTime<Utc>>,
    handshake_end_time: Option<DateTime<Utc>>,
}

impl StreamTemplate {
    fn from_session(session: &sluice_core::Session) -> Self {
        Self {
            sni: session.sni.clone(),
            target: session.target.clone(),
            connect_time: session.connect_time,
            connected_time: session.connected_time,
            handshake_end_time: session.handshake_end_time,
        }
    }
}

#[derive(Clone)]
struct StreamProxy {
    task: Arc<Task>,
    request: NetRequest,
    sender: UpstreamSender,
    template: StreamTemplate,
    streams: Arc<AtomicU64>,
}

/// What a stream reports to its recorder.
#[derive(Debug)]
enum StreamEvent {
    RequestData(Bytes),
    RequestEnd,
    ResponseHead {
        status: StatusCode,
        headers: HeaderMap,
    },
    ResponseData(Bytes),
    Failed(String),
}

impl StreamProxy {
    async fn handle(self, req: Request<Incoming>) -> Response<ProxyBody> {
        self.streams.fetch_add(1, Ordering::Relaxed);
        let (mut parts, body) = req.into_parts();

        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let user_agent = header_str(&parts.headers, USER_AGENT.as_str()).to_string();
        let ignore = self.task.resolve_ignore(self.request.host(), &uri, &user_agent);

        let mut ctx = ConnectionContext::new(self.task.clone());
        ctx.set_request(self.request.clone());
        {
            let session = ctx.session_mut();
            session.method = parts.method.to_string();
            session.uri = uri.clone();
            session.req_headers = header_pairs(&parts.headers);
            session.user_agent = Some(user_agent).filter(|ua| !ua.is_empty());
            session.protocol = Protocol::H2;
            session.ignore = ignore;
            session.sni = self.template.sni.clone();
            session.target = self.template.target.clone();
            session.connect_time = self.template.connect_time;
            session.connected_time = self.template.connected_time;
            session.handshake_end_time = self.template.handshake_end_time;
        }
        ctx.persist();
        tracing::debug!(session = %ctx.session().id, method = %parts.method, uri = %uri, ignore, "h2 stream");

        let capture = ExchangeCapture::for_session(self.task.capture_dir(), ctx.session());
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(record_stream(ctx, capture, rx));

        strip_hop_by_hop(&mut parts.headers);
        let target = if self.sender.is_h2() {
            parts.version = Version::HTTP_2;
            parts.headers.remove(HOST);
            format!("{}{}", self.request.origin(), uri)
        } else {
            parts.version = Version::HTTP_11;
            if !parts.headers.contains_key(HOST) {
                if let Ok(value) = HeaderValue::from_str(&host_header(&self.request)) {
                    parts.headers.insert(HOST, value);
                }
            }
            uri
        };
        parts.uri = match target.parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                let note = format!("invalid upstream uri: {e}");
                let _ = events.send(StreamEvent::Failed(note.clone()));
                return bad_gateway(note);
            }
        };

        let body = Tee::new(body, events.clone(), StreamEvent::RequestData, Some(StreamEvent::RequestEnd)).boxed_unsync();
        match self.sender.send(Request::from_parts(parts, body)).await {
            Ok(rsp) => {
                let (mut parts, body) = rsp.into_parts();
                let _ = events.send(StreamEvent::ResponseHead {
                    status: parts.status,
                    headers: parts.headers.clone(),
                });
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Tee::new(body, events, StreamEvent::ResponseData, None).boxed_unsync())
            }
            Err(e) => {
                let note = format!("upstream request failed: {e}");
                let _ = events.send(StreamEvent::Failed(note.clone()));
                bad_gateway(note)
            }
        }
    }
}

/// Owns one stream's session until every body tee has been dropped.
async fn record_stream(
    mut ctx: ConnectionContext,
    mut capture: Option<ExchangeCapture>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::RequestData(chunk) => {
                ctx.add_upload(chunk.len() as u64);
                if let Some(capture) = capture.as_mut() {
                    capture.request.write(&chunk).await;
                }
            }
            StreamEvent::RequestEnd => {
                ctx.session_mut().req_end_time = Some(Utc::now());
                if let Some(capture) = capture.as_mut() {
                    capture.request.finish().await;
                }
                ctx.persist();
            }
            StreamEvent::ResponseHead { status, headers } => {
                let session = ctx.session_mut();
                session.rsp_start_time = Some(Utc::now());
                session.state = status.as_u16();
                session.reason = status.canonical_reason().unwrap_or_default().to_string();
                session.rsp_headers = header_pairs(&headers);
                session.content_type = Some(header_str(&headers, CONTENT_TYPE.as_str()))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
                session.content_encoding = Some(header_str(&headers, CONTENT_ENCODING.as_str()))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
                ctx.persist();
            }
            StreamEvent::ResponseData(chunk) => {
                ctx.add_download(chunk.len() as u64);
                if let Some(capture) = capture.as_mut() {
                    capture.response.write(&chunk).await;
                }
            }
            StreamEvent::Failed(note) => ctx.fail(note),
        }
    }

    ctx.session_mut().rsp_end_time = Some(Utc::now());
    if let Some(capture) = capture.as_mut() {
        capture.finish().await;
    }
    ctx.finish();
}

/// Passes a body through unchanged, reporting each data frame and, once,
/// the end of the stream.
struct Tee<B> {
    inner: B,
    events: mpsc::UnboundedSender<StreamEvent>,
    data: fn(Bytes) -> StreamEvent,
    end: Option<StreamEvent>,
}

impl<B: Body<Data = Bytes> + Unpin> Tee<B> {
    fn new(
        inner: B,
        events: mpsc::UnboundedSender<StreamEvent>,
        data: fn(Bytes) -> StreamEvent,
        end: Option<StreamEvent>,
    ) -> Self {
        let mut tee = Self { inner, events, data, end };
        // An empty body may never be polled.
        if tee.inner.is_end_stream() {
            tee.report_end();
        }
        tee
    }

    fn report_end(&mut self) {
        if let Some(event) = self.end.take() {
            let _ = self.events.send(event);
        }
    }
}

impl<B: Body<Data = Bytes> + Unpin> Body for Tee<B> {
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();
        let polled = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    let _ = this.events.send((this.data)(data.clone()));
                }
                if this.inner.is_end_stream() {
                    this.report_end();
                }
            }
            Some(Err(_)) => {}
            None => this.report_end(),
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn bad_gateway(note: String) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(note))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut rsp = Response::new(body);
    *rsp.status_mut() = StatusCode::BAD_GATEWAY;
    rsp
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    // `te: trailers` is the one value HTTP/2 allows; gRPC depends on it.
    let trailers_only = headers
        .get_all(TE)
        .iter()
        .all(|v| v.as_bytes().eq_ignore_ascii_case(b"trailers"));
    if !trailers_only {
        headers.remove(TE);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
