//! Proxy request descriptor.
//!
//! A [`NetRequest`] is derived exactly once per connection from the first
//! request head (or the CONNECT authority) and never changes afterwards.
//! Three encodings of the target are accepted:
//!
//! - absolute URI: `http://example.com:8080/path`
//! - `Host` header with an optional `:port` suffix, next to an origin-form URI
//! - bare `host:port` authority as sent with CONNECT

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Default port for plain HTTP.
pub const HTTP_PORT: u16 = 80;

/// Default port for HTTPS.
pub const HTTPS_PORT: u16 = 443;

/// Where a proxied connection is headed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetRequest {
    host: String,
    port: u16,
    is_tls: bool,
}

impl NetRequest {
    /// Creates a descriptor from already-split parts.
    pub fn new(host: impl Into<String>, port: u16, is_tls: bool) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            is_tls,
        }
    }

    /// Returns the default port for the given transport.
    pub fn default_port(is_tls: bool) -> u16 {
        if is_tls {
            HTTPS_PORT
        } else {
            HTTP_PORT
        }
    }

    /// Parses a bare `host[:port]` authority, as found in a CONNECT request
    /// line or a `Host` header. Bracketed IPv6 literals are accepted.
    pub fn from_authority(authority: &str, is_tls: bool) -> Result<Self> {
        let (host, port) = split_authority(authority)?;
        Ok(Self::new(
            host,
            port.unwrap_or_else(|| Self::default_port(is_tls)),
            is_tls,
        ))
    }

    /// Derives the descriptor from a request target and its `Host` header.
    ///
    /// An absolute URI wins over the header and its scheme decides whether
    /// the origin speaks TLS. Otherwise the `Host` header is used, and as a
    /// last resort a target that is itself an authority.
    pub fn from_request(uri: &str, host_header: Option<&str>, is_tls: bool) -> Result<Self> {
        if let Some((scheme, rest)) = split_scheme(uri) {
            let is_tls = matches!(scheme.to_ascii_lowercase().as_str(), "https" | "wss");
            let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            return Self::from_authority(authority, is_tls);
        }

        if let Some(host) = host_header.map(str::trim).filter(|h| !h.is_empty()) {
            return Self::from_authority(host, is_tls);
        }

        if !uri.starts_with('/') && uri != "*" {
            let authority = uri.split('/').next().unwrap_or(uri);
            return Self::from_authority(authority, is_tls);
        }

        Err(CoreError::InvalidTarget(format!(
            "no host in request target {uri:?}"
        )))
    }

    /// Returns the host name (lowercase) or IP literal without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns whether the origin is reached over TLS.
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// Returns whether the host is an IP literal rather than a DNS name.
    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }

    /// Returns `host:port`, bracketing IPv6 literals, suitable for connecting.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Returns `scheme://host[:port]` with the port elided when it is the default.
    pub fn origin(&self) -> String {
        let scheme = if self.is_tls { "https" } else { "http" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == Self::default_port(self.is_tls) {
            format!("{scheme}://{host}")
        } else {
            format!("{scheme}://{host}:{}", self.port)
        }
    }
}

impl fmt::Display for NetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

fn split_authority(authority: &str) -> Result<(String, Option<u16>)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(CoreError::InvalidTarget("empty authority".into()));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| CoreError::InvalidTarget(format!("unclosed IPv6 literal {authority:?}")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None if tail.is_empty() => None,
            None => {
                return Err(CoreError::InvalidTarget(format!(
                    "trailing data after IPv6 literal {authority:?}"
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 literal.
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), None)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), Some(parse_port(port)?))),
        Some(_) => Err(CoreError::InvalidTarget(format!("missing host in {authority:?}"))),
        None => Ok((authority.to_string(), None)),
    }
}

/// Splits an absolute-form target into scheme and the rest. Origin-form
/// targets never match, even when their query embeds a URL.
fn split_scheme(uri: &str) -> Option<(&str, &str)> {
    if uri.starts_with('/') {
        return None;
    }
    let (scheme, rest) = uri.split_once("://")?;
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some((scheme, rest))
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| CoreError::InvalidTarget(format!("invalid port {port:?}")))
}

/// Rewrites a request target into origin form (`/path?query`).
///
/// Absolute URIs lose their scheme and authority. A target that omits the
/// leading `/` but starts with the `Host` value (`example.com/a`) becomes
/// path-relative (`/a`). Anything else is returned unchanged.
pub fn origin_form(uri: &str, host: &str) -> String {
    if let Some((_, rest)) = split_scheme(uri) {
        return match rest.find(['/', '?']) {
            Some(idx) if rest[idx..].starts_with('/') => rest[idx..].to_string(),
            Some(idx) => format!("/{}", &rest[idx..]),
            None => "/".to_string(),
        };
    }

    if uri.starts_with('/') || uri == "*" || host.is_empty() {
        return uri.to_string();
    }

    let Some(prefix) = uri.get(..host.len()) else {
        return uri.to_string();
    };
    if !prefix.eq_ignore_ascii_case(host) {
        return uri.to_string();
    }

    let mut rest = &uri[host.len()..];
    if let Some(after_colon) = rest.strip_prefix(':') {
        let digits = after_colon
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after_colon.len());
        rest = &after_colon[digits..];
    }

    match rest.chars().next() {
        None => "/".to_string(),
        Some('/') => rest.to_string(),
        Some('?') => format!("/{rest}"),
        // The host was only a prefix of a longer path segment.
        Some(_) => uri.to_string(),
    }
}
