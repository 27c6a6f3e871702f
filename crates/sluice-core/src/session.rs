//! Per-exchange session record.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix of the captured request body file.
pub const REQUEST_BODY_SUFFIX: &str = "req";

/// Suffix of the captured response body file.
pub const RESPONSE_BODY_SUFFIX: &str = "rsp";

static SESSION_SEQ: AtomicU32 = AtomicU32::new(0);

/// Application protocol carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    /// HTTP/1.x, plain or inside TLS.
    #[default]
    #[serde(rename = "http/1.1")]
    Http1,
    /// HTTP/2 over intercepted TLS.
    #[serde(rename = "h2")]
    H2,
    /// Opaque byte tunnel.
    #[serde(rename = "tunnel")]
    Tunnel,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::H2 => "h2",
            Protocol::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded exchange.
///
/// Timestamps are filled in as the connection progresses; unset ones mean
/// the stage was never reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub host: String,
    pub uri: String,
    pub method: String,
    pub is_tls: bool,
    pub req_headers: Vec<(String, String)>,
    pub rsp_headers: Vec<(String, String)>,
    /// HTTP status code, 0 until a response head arrives.
    pub state: u16,
    pub reason: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub user_agent: Option<String>,
    /// Resolved upstream address.
    pub target: Option<String>,
    pub start_time: DateTime<Utc>,
    pub connect_time: Option<DateTime<Utc>>,
    pub connected_time: Option<DateTime<Utc>>,
    pub handshake_end_time: Option<DateTime<Utc>>,
    pub req_end_time: Option<DateTime<Utc>>,
    pub rsp_start_time: Option<DateTime<Utc>>,
    pub rsp_end_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Body bytes sent to the origin.
    pub upload_bytes: u64,
    /// Body bytes received from the origin.
    pub download_bytes: u64,
    /// Ignored sessions are relayed but neither captured nor persisted.
    pub ignore: bool,
    pub note: Option<String>,
    pub protocol: Protocol,
    /// Server name from the ClientHello, when one was observed.
    pub sni: Option<String>,
}

impl Session {
    /// Creates an empty session with a fresh id, started now.
    pub fn new() -> Self {
        let start_time = Utc::now();
        Self::with_id(next_session_id(start_time), start_time)
    }

    /// Creates an empty session with an explicit id.
    pub fn with_id(id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            host: String::new(),
            uri: String::new(),
            method: String::new(),
            is_tls: false,
            req_headers: Vec::new(),
            rsp_headers: Vec::new(),
            state: 0,
            reason: String::new(),
            content_type: None,
            content_encoding: None,
            user_agent: None,
            target: None,
            start_time,
            connect_time: None,
            connected_time: None,
            handshake_end_time: None,
            req_end_time: None,
            rsp_start_time: None,
            rsp_end_time: None,
            end_time: None,
            upload_bytes: 0,
            download_bytes: 0,
            ignore: false,
            note: None,
            protocol: Protocol::Http1,
            sni: None,
        }
    }

    /// Appends a note, keeping earlier ones.
    pub fn add_note(&mut self, note: impl AsRef<str>) {
        let note = note.as_ref();
        match &mut self.note {
            Some(existing) if !existing.is_empty() => {
                existing.push_str("; ");
                existing.push_str(note);
            }
            _ => self.note = Some(note.to_string()),
        }
    }

    /// Sets `end_time` if it is not set yet. Returns whether it changed.
    pub fn mark_end(&mut self) -> bool {
        if self.end_time.is_some() {
            return false;
        }
        self.end_time = Some(Utc::now());
        true
    }

    /// Returns whether the session has ended.
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Looks up the first request header with this name (case-insensitive).
    pub fn req_header(&self, name: &str) -> Option<&str> {
        find_header(&self.req_headers, name)
    }

    /// Looks up the first response header with this name (case-insensitive).
    pub fn rsp_header(&self, name: &str) -> Option<&str> {
        find_header(&self.rsp_headers, name)
    }

    /// File name of the captured request body.
    pub fn request_body_file(&self) -> String {
        format!("{}.{}", self.id, REQUEST_BODY_SUFFIX)
    }

    /// File name of the captured response body.
    pub fn response_body_file(&self) -> String {
        format!("{}.{}", self.id, RESPONSE_BODY_SUFFIX)
    }

    /// Total elapsed milliseconds, if the session has ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Generates a process-unique, time-ordered session id.
pub fn next_session_id(now: DateTime<Utc>) -> String {
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:04x}", now.timestamp_millis(), seq & 0xffff)
}
