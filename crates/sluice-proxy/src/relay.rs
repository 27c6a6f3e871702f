//! Upstream relay for one HTTP/1 exchange.
//!
//! The request head is already parsed when the relay starts. Request frames
//! that arrive while the origin connection is still being set up are queued
//! and flushed, in order, as soon as it is ready. After that request and
//! response frames are forwarded as they arrive, counted and captured.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use chrono::Utc;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderValue, Method};
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::capture::ExchangeCapture;
use crate::codec::{
    header_pairs, BodyEncoder, BodyKind, Frame, MessageHead, RequestDecoder, RequestHead,
    ResponseDecoder, ResponseHead,
};
use crate::context::ConnectionContext;
use crate::error::{ExchangeError, Result};
use crate::io::BoxIo;
use crate::pending::PendingFrames;
use crate::tunnel;

/// A connected origin.
pub struct Upstream {
    pub io: BoxIo,
    pub addr: Option<SocketAddr>,
}

impl Upstream {
    pub fn new(io: BoxIo, addr: Option<SocketAddr>) -> Self {
        Self { io, addr }
    }
}

/// Relays one request and its response between client and origin.
pub struct Exchange<'a> {
    ctx: &'a mut ConnectionContext,
    capture: Option<ExchangeCapture>,
    request_encoder: BodyEncoder,
    response_encoder: BodyEncoder,
}

impl<'a> Exchange<'a> {
    pub fn new(ctx: &'a mut ConnectionContext, capture: Option<ExchangeCapture>) -> Self {
        Self {
            ctx,
            capture,
            request_encoder: BodyEncoder::Raw,
            response_encoder: BodyEncoder::Raw,
        }
    }

    /// Drives the exchange to completion. An error's message is the note
    /// to record on the session.
    pub async fn run<C>(
        mut self,
        downstream: BoxIo,
        mut decoder: RequestDecoder,
        head: RequestHead,
        connect: C,
    ) -> Result<()>
    where
        C: Future<Output = io::Result<Upstream>>,
    {
        let method = head.method.clone();
        self.request_encoder = match head.body_kind(None) {
            Ok(Some(kind)) => BodyEncoder::for_kind(kind),
            _ => BodyEncoder::Raw,
        };

        let (mut down_r, mut down_w) = tokio::io::split(downstream);

        self.ctx.session_mut().connect_time = Some(Utc::now());
        self.ctx.persist();

        let mut pending = PendingFrames::new();
        pending.push(Frame::Head(head));
        let mut request_done = false;

        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                biased;
                result = &mut connect => break result,
                frame = decoder.next_frame(&mut down_r), if !request_done => match frame {
                    Ok(Some(frame)) => {
                        request_done = matches!(frame, Frame::End);
                        pending.push(frame);
                    }
                    Ok(None) => return Err(ExchangeError::ClientClosedEarly.into()),
                    Err(e) => return Err(ExchangeError::BadRequest(e).into()),
                },
            }
        };

        let upstream = connected.map_err(ExchangeError::Connect)?;
        {
            let session = self.ctx.session_mut();
            session.connected_time = Some(Utc::now());
            session.target = upstream.addr.map(|a| a.to_string());
        }
        self.ctx.persist();

        let (mut up_r, mut up_w) = tokio::io::split(upstream.io);

        for frame in pending.drain() {
            self.send_request(&mut up_w, frame)
                .await
                .map_err(ExchangeError::UpstreamWrite)?;
        }

        let mut response = ResponseDecoder::new().with_request_method(method.clone());
        loop {
            tokio::select! {
                frame = decoder.next_frame(&mut down_r), if !request_done => match frame {
                    Ok(Some(frame)) => {
                        request_done = matches!(frame, Frame::End);
                        self.send_request(&mut up_w, frame)
                            .await
                            .map_err(ExchangeError::UpstreamWrite)?;
                    }
                    Ok(None) => return Err(ExchangeError::ClientClosedMidRequest.into()),
                    Err(e) => return Err(ExchangeError::BadRequest(e).into()),
                },
                frame = response.next_frame(&mut up_r) => match frame {
                    Ok(Some(Frame::Head(head))) if head.is_switching_protocols() => {
                        self.send_final_head(&mut down_w, head, &method)
                            .await
                            .map_err(ExchangeError::ClientWrite)?;
                        return self
                            .upgrade(down_r, down_w, decoder.into_buffer(), up_r, up_w, response.into_buffer())
                            .await;
                    }
                    Ok(Some(Frame::Head(head))) if head.is_informational() => {
                        let mut buf = BytesMut::new();
                        head.encode(&mut buf);
                        write_all(&mut down_w, &buf)
                            .await
                            .map_err(ExchangeError::ClientWrite)?;
                    }
                    Ok(Some(Frame::Head(head))) => {
                        self.send_final_head(&mut down_w, head, &method)
                            .await
                            .map_err(ExchangeError::ClientWrite)?;
                    }
                    Ok(Some(Frame::Body(chunk))) => {
                        self.ctx.add_download(chunk.len() as u64);
                        if let Some(capture) = self.capture.as_mut() {
                            capture.response.write(&chunk).await;
                        }
                        let mut buf = BytesMut::with_capacity(chunk.len() + 16);
                        self.response_encoder.encode_chunk(&chunk, &mut buf);
                        write_all(&mut down_w, &buf)
                            .await
                            .map_err(ExchangeError::ClientWrite)?;
                    }
                    Ok(Some(Frame::End)) => {
                        let mut buf = BytesMut::new();
                        self.response_encoder.encode_end(&mut buf);
                        write_all(&mut down_w, &buf)
                            .await
                            .map_err(ExchangeError::ClientWrite)?;
                        down_w.flush().await.map_err(ExchangeError::ClientWrite)?;
                        break;
                    }
                    Ok(None) => return Err(ExchangeError::NoResponse.into()),
                    Err(e) => return Err(ExchangeError::BadResponse(e).into()),
                },
            }
        }

        self.ctx.session_mut().rsp_end_time = Some(Utc::now());
        if let Some(capture) = self.capture.as_mut() {
            capture.finish().await;
        }
        self.ctx.persist();

        self.ctx.close_linked(&mut down_w, &mut up_w).await;
        Ok(())
    }

    async fn send_request<W>(&mut self, up: &mut W, frame: Frame<RequestHead>) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::new();
        match frame {
            Frame::Head(head) => head.encode(&mut buf),
            Frame::Body(chunk) => {
                self.ctx.add_upload(chunk.len() as u64);
                if let Some(capture) = self.capture.as_mut() {
                    capture.request.write(&chunk).await;
                }
                self.request_encoder.encode_chunk(&chunk, &mut buf);
            }
            Frame::End => {
                self.request_encoder.encode_end(&mut buf);
                self.ctx.session_mut().req_end_time = Some(Utc::now());
                if let Some(capture) = self.capture.as_mut() {
                    capture.request.finish().await;
                }
                self.ctx.persist();
            }
        }
        write_all(up, &buf).await?;
        up.flush().await
    }

    /// Records the final response head and mirrors it to the client.
    async fn send_final_head<W>(
        &mut self,
        down: &mut W,
        mut head: ResponseHead,
        method: &Method,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        {
            let session = self.ctx.session_mut();
            session.rsp_start_time = Some(Utc::now());
            session.state = head.status;
            session.reason = head.reason.clone();
            session.rsp_headers = header_pairs(&head.headers);
            session.content_type = head.header(CONTENT_TYPE.as_str()).map(str::to_string);
            session.content_encoding = head.header(CONTENT_ENCODING.as_str()).map(str::to_string);
        }
        self.ctx.persist();

        if !head.is_switching_protocols() {
            let kind = head.body_kind(Some(method))?.unwrap_or(BodyKind::Empty);
            self.response_encoder = BodyEncoder::for_kind(kind);
            head.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        write_all(down, &buf).await?;
        down.flush().await
    }

    /// Switches to a raw duplex copy after `101 Switching Protocols`.
    async fn upgrade(
        self,
        down_r: ReadHalf<BoxIo>,
        down_w: WriteHalf<BoxIo>,
        client_leftover: BytesMut,
        up_r: ReadHalf<BoxIo>,
        up_w: WriteHalf<BoxIo>,
        origin_leftover: BytesMut,
    ) -> Result<()> {
        let mut downstream = down_r.unsplit(down_w);
        let mut upstream = up_r.unsplit(up_w);

        if !origin_leftover.is_empty() {
            self.ctx.add_download(origin_leftover.len() as u64);
            downstream
                .write_all(&origin_leftover)
                .await
                .map_err(ExchangeError::ClientWrite)?;
        }
        if !client_leftover.is_empty() {
            self.ctx.add_upload(client_leftover.len() as u64);
            upstream
                .write_all(&client_leftover)
                .await
                .map_err(ExchangeError::UpstreamWrite)?;
        }

        self.ctx.session_mut().add_note("protocol upgraded");
        tunnel::relay(self.ctx, downstream, upstream).await;
        Ok(())
    }
}

async fn write_all<W: AsyncWrite + Unpin>(w: &mut W, buf: &[u8]) -> io::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    w.write_all(buf).await
}
