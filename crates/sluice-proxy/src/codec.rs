//! HTTP/1 message framing.
//!
//! A [`Decoder`] turns a byte stream into `Head`, `Body*`, `End` frames. All
//! decoding state lives in the decoder itself, so [`Decoder::next_frame`] can
//! be cancelled inside `tokio::select!` without losing bytes.

use std::fmt::Write as _;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest accepted message head.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Most headers accepted in one head.
pub const MAX_HEADERS: usize = 100;

/// Longest accepted chunk-size or trailer line.
const MAX_LINE_LEN: usize = 8 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// One unit of an HTTP message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<H> {
    Head(H),
    Body(Bytes),
    End,
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Something that can be parsed as a message head.
pub trait MessageHead: Sized {
    /// Parses a complete head from the front of `buf`, returning it and the
    /// number of bytes it occupied. `Ok(None)` means more bytes are needed.
    fn parse(buf: &[u8]) -> io::Result<Option<(Self, usize)>>;

    /// How the body after this head is framed. `None` means the head is
    /// interim and another head follows.
    fn body_kind(&self, request_method: Option<&Method>) -> io::Result<Option<BodyKind>>;
}

/// A parsed request line and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Returns the first value of a header as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns whether the client asked for a protocol upgrade.
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains_key(http::header::UPGRADE)
    }

    /// Serializes the head in HTTP/1 form.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut line = String::with_capacity(self.uri.len() + 32);
        let _ = write!(
            line,
            "{} {} {}\r\n",
            self.method,
            self.uri,
            version_str(self.version)
        );
        dst.put_slice(line.as_bytes());
        encode_headers(&self.headers, dst);
    }
}

impl MessageHead for RequestHead {
    fn parse(buf: &[u8]) -> io::Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf).map_err(invalid)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
            .map_err(invalid)?;
        let head = RequestHead {
            method,
            uri: req.path.unwrap_or_default().to_string(),
            version: version_from(req.version),
            headers: header_map(req.headers)?,
        };
        Ok(Some((head, len)))
    }

    fn body_kind(&self, _request_method: Option<&Method>) -> io::Result<Option<BodyKind>> {
        if self.headers.contains_key(TRANSFER_ENCODING) {
            return if is_chunked(&self.headers) {
                Ok(Some(BodyKind::Chunked))
            } else {
                Err(invalid("request transfer-encoding does not end in chunked"))
            };
        }
        Ok(Some(match content_length(&self.headers)? {
            Some(0) | None => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
        }))
    }
}

/// A parsed status line and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Returns the first value of a header as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 1xx responses are followed by another head.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status == 101
    }

    /// Serializes the head in HTTP/1 form.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut line = String::with_capacity(self.reason.len() + 16);
        let _ = write!(
            line,
            "{} {} {}\r\n",
            version_str(self.version),
            self.status,
            self.reason
        );
        dst.put_slice(line.as_bytes());
        encode_headers(&self.headers, dst);
    }
}

impl MessageHead for ResponseHead {
    fn parse(buf: &[u8]) -> io::Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        let len = match res.parse(buf).map_err(invalid)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let head = ResponseHead {
            status: res.code.unwrap_or_default(),
            reason: res.reason.unwrap_or_default().to_string(),
            version: version_from(res.version),
            headers: header_map(res.headers)?,
        };
        Ok(Some((head, len)))
    }

    fn body_kind(&self, request_method: Option<&Method>) -> io::Result<Option<BodyKind>> {
        if self.is_informational() {
            return Ok(None);
        }
        if request_method == Some(&Method::HEAD) || self.status == 204 || self.status == 304 {
            return Ok(Some(BodyKind::Empty));
        }
        if self.headers.contains_key(TRANSFER_ENCODING) {
            return Ok(Some(if is_chunked(&self.headers) {
                BodyKind::Chunked
            } else {
                BodyKind::UntilClose
            }));
        }
        Ok(Some(match content_length(&self.headers)? {
            Some(0) => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
            None => BodyKind::UntilClose,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilClose,
    End,
}

/// Incremental decoder for one direction of an HTTP/1 connection.
#[derive(Debug)]
pub struct Decoder<H> {
    buf: BytesMut,
    state: State,
    eof: bool,
    request_method: Option<Method>,
    _head: std::marker::PhantomData<fn() -> H>,
}

pub type RequestDecoder = Decoder<RequestHead>;
pub type ResponseDecoder = Decoder<ResponseHead>;

impl<H: MessageHead> Default for Decoder<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: MessageHead> Decoder<H> {
    pub fn new() -> Self {
        Self::with_buffer(BytesMut::new())
    }

    /// Starts decoding from bytes that were already read off the stream.
    pub fn with_buffer(buf: BytesMut) -> Self {
        Self {
            buf,
            state: State::Head,
            eof: false,
            request_method: None,
            _head: std::marker::PhantomData,
        }
    }

    /// Sets the method of the request this response answers.
    pub fn with_request_method(mut self, method: Method) -> Self {
        self.request_method = Some(method);
        self
    }

    /// Bytes read but not yet decoded.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Gives up the decoder, returning undecoded bytes.
    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }

    /// Returns the next frame, reading from `io` as needed.
    ///
    /// `Ok(None)` means the peer closed cleanly between messages.
    pub async fn next_frame<R>(&mut self, io: &mut R) -> io::Result<Option<Frame<H>>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(frame) = self.decode()? {
                return Ok(Some(frame));
            }
            if self.eof {
                return if self.state == State::Head && self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-message",
                    ))
                };
            }
            self.buf.reserve(READ_CHUNK);
            if io.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }

    /// Decodes one frame from the buffer, if one is complete.
    fn decode(&mut self) -> io::Result<Option<Frame<H>>> {
        loop {
            match self.state {
                State::Head => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let Some((head, len)) = H::parse(&self.buf)? else {
                        if self.buf.len() > MAX_HEAD_LEN {
                            return Err(invalid("message head too large"));
                        }
                        return Ok(None);
                    };
                    self.buf.advance(len);
                    self.state = match head.body_kind(self.request_method.as_ref())? {
                        None => State::Head,
                        Some(BodyKind::Empty) => State::End,
                        Some(BodyKind::Length(n)) => State::Length(n),
                        Some(BodyKind::Chunked) => State::ChunkSize,
                        Some(BodyKind::UntilClose) => State::UntilClose,
                    };
                    return Ok(Some(Frame::Head(head)));
                }
                State::End => {
                    self.state = State::Head;
                    return Ok(Some(Frame::End));
                }
                State::Length(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(n).freeze();
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::End
                    } else {
                        State::Length(remaining)
                    };
                    return Ok(Some(Frame::Body(chunk)));
                }
                State::UntilClose => {
                    if !self.buf.is_empty() {
                        return Ok(Some(Frame::Body(self.buf.split().freeze())));
                    }
                    if self.eof {
                        self.state = State::Head;
                        return Ok(Some(Frame::End));
                    }
                    return Ok(None);
                }
                State::ChunkSize => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData(size)
                    };
                }
                State::ChunkData(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(self.buf.len() as u64) as usize;
                    let chunk = self.buf.split_to(n).freeze();
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData(remaining)
                    };
                    return Ok(Some(Frame::Body(chunk)));
                }
                State::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(invalid("missing CRLF after chunk data"));
                    }
                    self.buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    // Trailer fields are dropped.
                    if line.is_empty() {
                        self.state = State::Head;
                        return Ok(Some(Frame::End));
                    }
                }
            }
        }
    }

    /// Removes one CRLF-terminated line from the buffer, without the CRLF.
    fn take_line(&mut self) -> io::Result<Option<Bytes>> {
        match self.buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                Ok(Some(line))
            }
            None if self.buf.len() > MAX_LINE_LEN => Err(invalid("chunk line too long")),
            None => Ok(None),
        }
    }
}

/// Re-frames decoded body bytes for the outgoing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoder {
    /// Bytes pass through; the head's framing headers still apply.
    Raw,
    /// Each frame becomes one chunk.
    Chunked,
}

impl BodyEncoder {
    pub fn for_kind(kind: BodyKind) -> Self {
        match kind {
            BodyKind::Chunked => BodyEncoder::Chunked,
            _ => BodyEncoder::Raw,
        }
    }

    /// Appends one body frame. Empty data writes nothing, so a chunked body
    /// is never terminated early.
    pub fn encode_chunk(&self, data: &[u8], dst: &mut BytesMut) {
        if data.is_empty() {
            return;
        }
        match self {
            BodyEncoder::Raw => dst.put_slice(data),
            BodyEncoder::Chunked => {
                let mut size = String::with_capacity(12);
                let _ = write!(size, "{:x}\r\n", data.len());
                dst.put_slice(size.as_bytes());
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
        }
    }

    /// Appends the end-of-body marker.
    pub fn encode_end(&self, dst: &mut BytesMut) {
        if *self == BodyEncoder::Chunked {
            dst.put_slice(b"0\r\n\r\n");
        }
    }
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

/// Flattens headers into name/value text pairs, in map order.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn header_map(headers: &[httparse::Header<'_>]) -> io::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for h in headers {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(invalid)?;
        let value = HeaderValue::from_bytes(h.value).map_err(invalid)?;
        map.append(name, value);
    }
    Ok(map)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .last()
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        for part in value.to_str().map_err(invalid)?.split(',') {
            let n: u64 = part
                .trim()
                .parse()
                .map_err(|_| invalid("invalid content-length"))?;
            if length.is_some_and(|l| l != n) {
                return Err(invalid("conflicting content-length values"));
            }
            length = Some(n);
        }
    }
    Ok(length)
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(invalid)?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid("invalid chunk size"))
}

fn version_from(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

fn invalid(err: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}
