//! HTTP response builder and wire framing.
//!
//! The handler fills a [`Response`] and submits it through its
//! [`Request`](crate::Request). Headers accumulate as already-encoded lines;
//! the connection decides framing (`Content-Length` vs chunked vs
//! close-delimited) right before the head goes out, injecting `Date` and
//! `Connection` where the handler did not.

use crate::{
    errors::Error,
    http::types::{parse_u64_decimal, trim_ows, StatusCode, Version},
};
use bytes::Bytes;
use std::borrow::Cow;
use tokio::sync::mpsc;

/// Handler-visible writes back-pressure through this channel depth.
const BODY_CHANNEL_DEPTH: usize = 2;

/// Response payload source.
pub(crate) enum Body {
    /// No body at all.
    Empty,
    /// Complete body known up front.
    Full(Bytes),
    /// Body produced incrementally; `length` when known a priori.
    Stream {
        length: Option<u64>,
        rx: mpsc::Receiver<Bytes>,
    },
}

impl Body {
    pub(crate) fn known_length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(data) => Some(data.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }
}

/// Framing chosen for a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Identity framing: exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// HTTP/1.0 fallback: body ends when the connection closes.
    CloseDelimited,
}

/// One `WWW-Authenticate` challenge.
///
/// Serialized in insertion order, one header per challenge; parameter values
/// containing tspecials are quoted.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    scheme: String,
    realm: Option<String>,
    params: Vec<(String, String)>,
}

impl Challenge {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            realm: None,
            params: Vec::new(),
        }
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"www-authenticate: ");
        out.extend_from_slice(self.scheme.as_bytes());

        let mut first = true;
        let mut lead = |out: &mut Vec<u8>, name: &str| {
            out.extend_from_slice(if first { b" " } else { b", " });
            first = false;
            out.extend_from_slice(name.as_bytes());
            out.push(b'=');
        };

        // realm is a quoted-string by grammar, not merely when it needs it.
        if let Some(realm) = &self.realm {
            lead(out, "realm");
            write_quoted(out, realm);
        }
        for (name, value) in &self.params {
            lead(out, name);
            write_param_value(out, value);
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Quotes `value` when it contains tspecials (RFC 2616 token separators) or
/// is empty; otherwise emits it bare.
fn write_param_value(out: &mut Vec<u8>, value: &str) {
    let needs_quoting = value.is_empty()
        || value.bytes().any(|b| {
            matches!(
                b,
                b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/'
                    | b'[' | b']' | b'?' | b'=' | b'{' | b'}' | b' ' | b'\t'
            )
        });

    if !needs_quoting {
        out.extend_from_slice(value.as_bytes());
        return;
    }
    write_quoted(out, value);
}

fn write_quoted(out: &mut Vec<u8>, value: &str) {
    out.push(b'"');
    for b in value.bytes() {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
}

/// HTTP response under construction.
///
/// # Examples
///
/// ```
/// use quay_http::{Response, StatusCode};
///
/// let mut resp = Response::new(StatusCode::Ok);
/// resp.header("content-type", "text/plain")
///     .body_bytes("Hello, World!");
/// ```
pub struct Response {
    status: StatusCode,
    reason: Option<Cow<'static, str>>,
    headers: Vec<u8>,
    challenges: Vec<Challenge>,
    body: Body,
    close: bool,
    have_hdr_connection: bool,
    have_hdr_date: bool,
    have_hdr_body_spec: bool,
    declared_length: Option<u64>,
    declared_chunked: bool,
    tunnel_head: bool,
    conflict: Option<&'static str>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            challenges: Vec::new(),
            body: Body::Empty,
            close: false,
            have_hdr_connection: false,
            have_hdr_date: false,
            have_hdr_body_spec: false,
            declared_length: None,
            declared_chunked: false,
            tunnel_head: false,
            conflict: None,
        }
    }

    #[inline(always)]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Overrides the default reason phrase.
    pub fn reason(&mut self, reason: impl Into<Cow<'static, str>>) -> &mut Self {
        self.reason = Some(reason.into());
        self
    }

    /// Appends one header line.
    ///
    /// `Connection`, `Date`, `Content-Length` and `Transfer-Encoding` are
    /// tracked so the connection neither duplicates them nor lets two
    /// handler-supplied copies conflict.
    pub fn header(&mut self, name: &str, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.note_special_header(name, value);

        self.headers.extend_from_slice(name.as_bytes());
        self.headers.extend_from_slice(b": ");
        self.headers.extend_from_slice(value);
        self.headers.extend_from_slice(b"\r\n");
        self
    }

    fn note_special_header(&mut self, name: &str, value: &[u8]) {
        if name.eq_ignore_ascii_case("connection") {
            if self.have_hdr_connection {
                self.conflict = Some("duplicate connection header");
            }
            self.have_hdr_connection = true;
            if value
                .split(|&b| b == b',')
                .any(|part| trim_ows(part).eq_ignore_ascii_case(b"close"))
            {
                self.close = true;
            }
        } else if name.eq_ignore_ascii_case("date") {
            if self.have_hdr_date {
                self.conflict = Some("duplicate date header");
            }
            self.have_hdr_date = true;
        } else if name.eq_ignore_ascii_case("content-length") {
            if self.have_hdr_body_spec {
                self.conflict = Some("duplicate body-spec header");
            }
            self.have_hdr_body_spec = true;
            match parse_u64_decimal(trim_ows(value)) {
                Some(len) => self.declared_length = Some(len),
                None => self.conflict = Some("invalid content-length header"),
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if self.have_hdr_body_spec {
                self.conflict = Some("duplicate body-spec header");
            }
            self.have_hdr_body_spec = true;
            if trim_ows(value).eq_ignore_ascii_case(b"chunked") {
                self.declared_chunked = true;
            } else {
                self.conflict = Some("unsupported transfer-encoding header");
            }
        }
    }

    /// Attaches an authentication challenge; one `WWW-Authenticate` header is
    /// emitted per challenge, in insertion order.
    pub fn challenge(&mut self, challenge: Challenge) -> &mut Self {
        self.challenges.push(challenge);
        self
    }

    /// Forces the connection to close after this response.
    pub fn close(&mut self) -> &mut Self {
        self.close = true;
        self
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.close
    }

    /// Sets a complete body.
    pub fn body_bytes(&mut self, data: impl Into<Bytes>) -> &mut Self {
        if !matches!(self.body, Body::Empty) {
            self.conflict = Some("body already set");
            return self;
        }
        self.body = Body::Full(data.into());
        self
    }

    /// Sets a streamed body pulled from `rx`; pass `length` when the total
    /// size is known a priori so identity framing can be used.
    pub fn body_stream(&mut self, length: Option<u64>, rx: mpsc::Receiver<Bytes>) -> &mut Self {
        if !matches!(self.body, Body::Empty) {
            self.conflict = Some("body already set");
            return self;
        }
        self.body = Body::Stream { length, rx };
        self
    }

    /// Switches the body to push mode and returns the handler's writer.
    pub(crate) fn attach_writer(&mut self) -> Result<BodyWriter, Error> {
        if !matches!(self.body, Body::Empty) {
            return Err(Error::HandlerSubmit("body already set"));
        }
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        self.body = Body::Stream {
            length: self.declared_length,
            rx,
        };
        Ok(BodyWriter { tx })
    }

    #[inline]
    pub(crate) fn has_body(&self) -> bool {
        !matches!(self.body, Body::Empty)
    }

    /// Handler conflicts surface at submit time, not header-append time, so
    /// the builder keeps its fluent shape.
    pub(crate) fn check_submittable(&self) -> Result<(), Error> {
        match self.conflict {
            Some(msg) => Err(Error::HandlerSubmit(msg)),
            None => Ok(()),
        }
    }

    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Empty)
    }

    /// A 2xx CONNECT response announces no body at all: no framing headers
    /// and no connection option, since the socket stops being HTTP.
    pub(crate) fn set_tunnel_head(&mut self) {
        self.tunnel_head = true;
    }

    /// Serializes the response head and decides body framing.
    ///
    /// `keep_alive` is the connection's verdict for *after* this response;
    /// it already accounts for the request's wishes, pipeline state and this
    /// response's `close` flag.
    pub(crate) fn encode_head(
        &self,
        version: Version,
        keep_alive: bool,
        date: &str,
    ) -> Result<(Vec<u8>, Framing), Error> {
        self.check_submittable()?;

        let framing = self.decide_framing(version)?;

        let mut head = Vec::with_capacity(128 + self.headers.len());
        head.extend_from_slice(version.as_str().as_bytes());
        head.push(b' ');
        head.extend_from_slice(self.status.code().to_string().as_bytes());
        head.push(b' ');
        head.extend_from_slice(
            self.reason
                .as_deref()
                .unwrap_or_else(|| self.status.reason())
                .as_bytes(),
        );
        head.extend_from_slice(b"\r\n");

        head.extend_from_slice(&self.headers);
        for challenge in &self.challenges {
            challenge.write_to(&mut head);
        }

        if !self.have_hdr_date {
            head.extend_from_slice(b"date: ");
            head.extend_from_slice(date.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        if !self.have_hdr_connection && !self.tunnel_head {
            let value: Option<&[u8]> = match (version, keep_alive) {
                (Version::Http11, true) => None,
                (Version::Http11, false) => Some(b"close"),
                (Version::Http10, true) => Some(b"keep-alive"),
                (Version::Http10, false) => Some(b"close"),
            };
            if let Some(value) = value {
                head.extend_from_slice(b"connection: ");
                head.extend_from_slice(value);
                head.extend_from_slice(b"\r\n");
            }
        }

        if !self.have_hdr_body_spec && !self.status.forbids_body() && !self.tunnel_head {
            match framing {
                Framing::Length(len) => {
                    head.extend_from_slice(b"content-length: ");
                    head.extend_from_slice(len.to_string().as_bytes());
                    head.extend_from_slice(b"\r\n");
                }
                Framing::Chunked => {
                    head.extend_from_slice(b"transfer-encoding: chunked\r\n");
                }
                Framing::CloseDelimited => {}
            }
        }

        head.extend_from_slice(b"\r\n");
        Ok((head, framing))
    }

    /// Framing precedence: handler-declared body spec, then known length,
    /// then chunked on HTTP/1.1, then close-delimited on HTTP/1.0.
    fn decide_framing(&self, version: Version) -> Result<Framing, Error> {
        if self.status.forbids_body() || self.tunnel_head {
            return Ok(Framing::Length(0));
        }
        if self.declared_chunked {
            if version == Version::Http10 {
                return Err(Error::HandlerSubmit("chunked response on HTTP/1.0"));
            }
            return Ok(Framing::Chunked);
        }
        if let Some(declared) = self.declared_length {
            return Ok(Framing::Length(declared));
        }
        if let Some(len) = self.body.known_length() {
            return Ok(Framing::Length(len));
        }
        Ok(match version {
            Version::Http11 => Framing::Chunked,
            Version::Http10 => Framing::CloseDelimited,
        })
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("close", &self.close)
            .field("has_body", &self.has_body())
            .finish()
    }
}

/// Push-mode body sink handed to the handler by
/// [`Request::respond_writer`](crate::Request::respond_writer).
///
/// Writes suspend the handler while the connection drains previous chunks;
/// dropping the writer (or calling [`finish`](BodyWriter::finish)) ends the
/// body.
pub struct BodyWriter {
    tx: mpsc::Sender<Bytes>,
}

impl BodyWriter {
    /// Queues one body chunk, suspending until the connection has room.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.tx
            .send(data.into())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Ends the body. Equivalent to dropping the writer.
    pub fn finish(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATE: &str = "Tue, 15 Nov 1994 08:12:31 GMT";

    fn head_str(resp: &Response, version: Version, keep_alive: bool) -> (String, Framing) {
        let (head, framing) = resp.encode_head(version, keep_alive, DATE).unwrap();
        (String::from_utf8(head).unwrap(), framing)
    }

    #[test]
    fn status_line_and_injected_headers() {
        let resp = Response::new(StatusCode::Ok);
        let (head, framing) = head_str(&resp, Version::Http11, true);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("date: Tue, 15 Nov 1994 08:12:31 GMT\r\n"));
        assert!(head.contains("content-length: 0\r\n"));
        assert!(!head.contains("connection:"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(framing, Framing::Length(0));
    }

    #[test]
    fn custom_reason_phrase() {
        let mut resp = Response::new(StatusCode::Ok);
        resp.reason("Connection Established");
        let (head, _) = head_str(&resp, Version::Http11, true);
        assert!(head.starts_with("HTTP/1.1 200 Connection Established\r\n"));
    }

    #[test]
    fn connection_header_injection() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, true,  None),
            (Version::Http11, false, Some("connection: close\r\n")),
            (Version::Http10, true,  Some("connection: keep-alive\r\n")),
            (Version::Http10, false, Some("connection: close\r\n")),
        ];

        for (version, keep_alive, expected) in cases {
            let resp = Response::new(StatusCode::Ok);
            let (head, _) = head_str(&resp, version, keep_alive);
            match expected {
                Some(line) => assert!(head.contains(line), "{version:?}/{keep_alive}: {head}"),
                None => assert!(!head.contains("connection:"), "{version:?}/{keep_alive}"),
            }
        }
    }

    #[test]
    fn handler_connection_header_suppresses_injection() {
        let mut resp = Response::new(StatusCode::Ok);
        resp.header("Connection", "close");
        assert!(resp.wants_close());

        let (head, _) = head_str(&resp, Version::Http11, false);
        assert_eq!(head.matches("onnection").count(), 1);
    }

    #[test]
    fn framing_precedence() {
        // Rule 1: handler-set content-length wins.
        let mut resp = Response::new(StatusCode::Ok);
        resp.header("content-length", "5").body_bytes("hello");
        let (head, framing) = head_str(&resp, Version::Http11, true);
        assert_eq!(framing, Framing::Length(5));
        assert_eq!(head.matches("content-length").count(), 1);

        // Rule 2: known body length is injected.
        let mut resp = Response::new(StatusCode::Ok);
        resp.body_bytes("hello");
        let (head, framing) = head_str(&resp, Version::Http11, true);
        assert_eq!(framing, Framing::Length(5));
        assert!(head.contains("content-length: 5\r\n"));

        // Rule 3: unknown length on HTTP/1.1 goes chunked.
        let (_tx, rx) = mpsc::channel(1);
        let mut resp = Response::new(StatusCode::Ok);
        resp.body_stream(None, rx);
        let (head, framing) = head_str(&resp, Version::Http11, true);
        assert_eq!(framing, Framing::Chunked);
        assert!(head.contains("transfer-encoding: chunked\r\n"));

        // Rule 4: unknown length on HTTP/1.0 is close-delimited.
        let (_tx, rx) = mpsc::channel(1);
        let mut resp = Response::new(StatusCode::Ok);
        resp.body_stream(None, rx);
        let (head, framing) = head_str(&resp, Version::Http10, false);
        assert_eq!(framing, Framing::CloseDelimited);
        assert!(!head.contains("content-length"));
        assert!(!head.contains("transfer-encoding"));
        assert!(head.contains("connection: close\r\n"));

        // Known stream length still uses identity framing.
        let (_tx, rx) = mpsc::channel(1);
        let mut resp = Response::new(StatusCode::Ok);
        resp.body_stream(Some(11), rx);
        let (_, framing) = head_str(&resp, Version::Http11, true);
        assert_eq!(framing, Framing::Length(11));
    }

    #[test]
    fn chunked_response_rejected_on_http10() {
        let mut resp = Response::new(StatusCode::Ok);
        resp.header("transfer-encoding", "chunked");
        assert_eq!(
            resp.encode_head(Version::Http10, false, DATE).map(|_| ()),
            Err(Error::HandlerSubmit("chunked response on HTTP/1.0"))
        );
    }

    #[test]
    fn bodyless_statuses_have_no_framing_headers() {
        let resp = Response::new(StatusCode::NoContent);
        let (head, framing) = head_str(&resp, Version::Http11, true);
        assert_eq!(framing, Framing::Length(0));
        assert!(!head.contains("content-length"));
        assert!(!head.contains("transfer-encoding"));
    }

    #[test]
    fn duplicate_special_headers_conflict() {
        let mut resp = Response::new(StatusCode::Ok);
        resp.header("content-length", "5")
            .header("transfer-encoding", "chunked");
        assert_eq!(
            resp.check_submittable(),
            Err(Error::HandlerSubmit("duplicate body-spec header"))
        );

        let mut resp = Response::new(StatusCode::Ok);
        resp.header("date", DATE).header("date", DATE);
        assert_eq!(
            resp.check_submittable(),
            Err(Error::HandlerSubmit("duplicate date header"))
        );

        let mut resp = Response::new(StatusCode::Ok);
        resp.header("connection", "close")
            .header("connection", "keep-alive");
        assert_eq!(
            resp.check_submittable(),
            Err(Error::HandlerSubmit("duplicate connection header"))
        );

        let mut resp = Response::new(StatusCode::Ok);
        resp.body_bytes("a").body_bytes("b");
        assert_eq!(
            resp.check_submittable(),
            Err(Error::HandlerSubmit("body already set"))
        );
    }

    #[test]
    fn challenges_serialize_in_order_with_quoting() {
        let mut resp = Response::new(StatusCode::Unauthorized);
        resp.challenge(Challenge::new("Basic").realm("mail store"))
            .challenge(
                Challenge::new("Bearer")
                    .param("error", "invalid_token")
                    .param("scope", "read write"),
            );

        let (head, _) = head_str(&resp, Version::Http11, true);
        let basic = head.find("www-authenticate: Basic realm=\"mail store\"\r\n");
        let bearer =
            head.find("www-authenticate: Bearer error=invalid_token, scope=\"read write\"\r\n");
        assert!(basic.is_some(), "{head}");
        assert!(bearer.is_some(), "{head}");
        assert!(basic < bearer);
    }

    #[test]
    fn quoted_values_escape_embedded_quotes() {
        let mut out = Vec::new();
        write_param_value(&mut out, "say \"hi\"");
        assert_eq!(out, b"\"say \\\"hi\\\"\"");

        let mut out = Vec::new();
        write_param_value(&mut out, "token123");
        assert_eq!(out, b"token123");

        let mut out = Vec::new();
        write_param_value(&mut out, "");
        assert_eq!(out, b"\"\"");
    }
}
