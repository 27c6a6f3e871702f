//! First-bytes protocol detection.
//!
//! The sniffer only looks at bytes; it never consumes them. Whatever was read
//! is handed on to the chosen pipeline and replayed there.

/// Longest method token accepted as plain HTTP.
const MAX_METHOD_LEN: usize = 16;

const CONNECT: &[u8] = b"CONNECT ";

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;

/// TLS handshake message type for ClientHello.
const CLIENT_HELLO: u8 = 0x01;

/// Bytes needed before the sniffer can always decide.
pub const MAX_SNIFF_LEN: usize = MAX_METHOD_LEN + 1;

/// Outcome of looking at the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// `CONNECT` request line.
    Connect,
    /// Any other HTTP/1 request line.
    Http,
    /// A TLS handshake record without a preceding CONNECT.
    Tls,
    /// Too few bytes to decide; read more.
    Incomplete,
    /// Nothing we understand.
    Unknown,
}

/// Classifies a connection by its first bytes. First match wins, in the
/// order CONNECT, HTTP, TLS.
pub fn sniff(buf: &[u8]) -> Sniff {
    if buf.is_empty() {
        return Sniff::Incomplete;
    }

    let mut pending = false;

    match token_match(buf, CONNECT) {
        Some(true) => return Sniff::Connect,
        Some(false) => pending = true,
        None => {}
    }

    match method_token(buf) {
        Some(true) => return Sniff::Http,
        Some(false) => pending = true,
        None => {}
    }

    if buf[0] == TLS_HANDSHAKE {
        if buf.len() < 3 {
            return Sniff::Incomplete;
        }
        if looks_like_client_hello(buf) {
            return Sniff::Tls;
        }
    }

    if pending {
        Sniff::Incomplete
    } else {
        Sniff::Unknown
    }
}

/// `Some(true)` on a full match, `Some(false)` if `buf` is a strict prefix of
/// `token`, `None` otherwise.
fn token_match(buf: &[u8], token: &[u8]) -> Option<bool> {
    if buf.len() >= token.len() {
        buf.starts_with(token).then_some(true)
    } else {
        token.starts_with(buf).then_some(false)
    }
}

/// `Some(true)` when `buf` starts with a method token and a space,
/// `Some(false)` while it is still all token characters, `None` otherwise.
fn method_token(buf: &[u8]) -> Option<bool> {
    let len = buf.iter().take_while(|b| is_tchar(**b)).count();
    if len == 0 || len > MAX_METHOD_LEN {
        return None;
    }
    match buf.get(len) {
        Some(b' ') => Some(true),
        Some(_) => None,
        None => Some(false),
    }
}

/// RFC 7230 `tchar`.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Checks the TLS record header: handshake type, major and minor version
/// at most 3.
pub fn looks_like_client_hello(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[0] == TLS_HANDSHAKE && buf[1] <= 3 && buf[2] <= 3
}

/// Length of the first TLS record including its header, once the header is
/// available.
pub fn tls_record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    Some(5 + u16::from_be_bytes([buf[3], buf[4]]) as usize)
}

/// Extracts the server name from a complete ClientHello record.
pub fn client_hello_sni(buf: &[u8]) -> Option<String> {
    let record_len = tls_record_len(buf)?;
    if buf[0] != TLS_HANDSHAKE || buf.len() < record_len {
        return None;
    }
    let record = &buf[5..record_len];

    if record.len() < 4 || record[0] != CLIENT_HELLO {
        return None;
    }
    let hs_len = u32::from_be_bytes([0, record[1], record[2], record[3]]) as usize;
    // A ClientHello split across records is not parsed.
    let body = record.get(4..4 + hs_len)?;

    let mut r = Reader(body);
    r.skip(2 + 32)?; // client_version, random
    let session_id = r.u8()? as usize;
    r.skip(session_id)?;
    let suites = r.u16()? as usize;
    r.skip(suites)?;
    let compression = r.u8()? as usize;
    r.skip(compression)?;

    let ext_len = r.u16()? as usize;
    let mut exts = Reader(r.take(ext_len)?);

    while !exts.0.is_empty() {
        let ext_type = exts.u16()?;
        let len = exts.u16()? as usize;
        let data = exts.take(len)?;
        if ext_type != 0x0000 {
            continue;
        }

        let mut list = Reader(data);
        let list_len = list.u16()? as usize;
        let mut names = Reader(list.take(list_len)?);
        while !names.0.is_empty() {
            let name_type = names.u8()?;
            let name_len = names.u16()? as usize;
            let name = names.take(name_len)?;
            if name_type != 0x00 {
                continue;
            }
            let host = std::str::from_utf8(name).ok()?;
            let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
            if !host.is_empty() {
                return Some(host);
            }
        }
    }

    None
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Some(head)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A minimal ClientHello record with an SNI extension.
    pub(crate) fn client_hello(sni: &str) -> Vec<u8> {
        let name = sni.as_bytes();
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni_ext.push(0);
        sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(name);

        let mut exts = Vec::new();
        exts.extend_from_slice(&[0x00, 0x00]);
        exts.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni_ext);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![CLIENT_HELLO];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    #[test]
    fn connect_wins_over_http() {
        assert_eq!(sniff(b"CONNECT example.com:443 HTTP/1.1\r\n"), Sniff::Connect);
    }

    #[test]
    fn http_methods() {
        assert_eq!(sniff(b"GET / HTTP/1.1\r\n"), Sniff::Http);
        assert_eq!(sniff(b"OPTIONS * HTTP/1.1\r\n"), Sniff::Http);
        assert_eq!(sniff(b"PATCH /x HTTP/1.1\r\n"), Sniff::Http);
    }

    #[test]
    fn extension_methods_are_http() {
        assert_eq!(sniff(b"PROPFIND /dav/ HTTP/1.1\r\n"), Sniff::Http);
        assert_eq!(sniff(b"MKCOL /dav/new HTTP/1.1\r\n"), Sniff::Http);
        assert_eq!(sniff(b"PROPFI"), Sniff::Incomplete);
        assert_eq!(sniff(b"VERSION-CONTROL /x HTTP/1.1\r\n"), Sniff::Http);
        assert_eq!(sniff(b"ABCDEFGHIJKLMNOPQ / HTTP/1.1\r\n"), Sniff::Unknown);
    }

    #[test]
    fn short_prefix_is_incomplete() {
        assert_eq!(sniff(b""), Sniff::Incomplete);
        assert_eq!(sniff(b"CONN"), Sniff::Incomplete);
        assert_eq!(sniff(b"GE"), Sniff::Incomplete);
        assert_eq!(sniff(b"P"), Sniff::Incomplete);
        assert_eq!(sniff(&[0x16, 0x03]), Sniff::Incomplete);
    }

    #[test]
    fn method_without_space_is_unknown() {
        assert_eq!(sniff(b"GET/ HTTP/1.1"), Sniff::Unknown);
        assert_eq!(sniff(b"GET\t/ HTTP/1.1"), Sniff::Unknown);
    }

    #[test]
    fn tls_record_header() {
        assert_eq!(sniff(&[0x16, 0x03, 0x01, 0x02, 0x00]), Sniff::Tls);
        assert_eq!(sniff(&[0x16, 0x03, 0x04, 0x02, 0x00]), Sniff::Unknown);
        assert_eq!(sniff(&[0x16, 0x04, 0x01]), Sniff::Unknown);
        assert_eq!(sniff(&[0x17, 0x03, 0x03]), Sniff::Unknown);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(sniff(b"SSH-2.0-OpenSSH_9.6\r\n"), Sniff::Unknown);
        assert_eq!(sniff(&[0x00, 0x01, 0x02]), Sniff::Unknown);
    }

    #[test]
    fn sni_is_extracted() {
        let hello = client_hello("Example.COM.");
        assert!(looks_like_client_hello(&hello));
        assert_eq!(tls_record_len(&hello), Some(hello.len()));
        assert_eq!(client_hello_sni(&hello).as_deref(), Some("example.com"));
    }

    #[test]
    fn truncated_hello_has_no_sni() {
        let hello = client_hello("example.com");
        assert_eq!(client_hello_sni(&hello[..hello.len() - 3]), None);
        assert_eq!(client_hello_sni(&hello[..4]), None);
    }
}
