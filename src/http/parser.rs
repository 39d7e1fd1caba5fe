//! Incremental request-head parser.
//!
//! The parser is a pure function over the connection's input buffer: it either
//! consumes one complete request head and returns it, reports that more bytes
//! are needed, or fails with the error that decides the synthesized response
//! (400 / 414 / 431 / 501).

use crate::{
    errors::Error,
    http::types::{is_token, parse_u64_decimal, trim_ows, Header, HeaderMap, Version},
    limits::ReqLimits,
};
use bytes::{Bytes, BytesMut};
use memchr::{memchr, memchr_iter};

/// How a request payload is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    /// No payload follows the head.
    None,
    /// Identity framing with this many bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// A fully parsed request head.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: BodyKind,
    pub(crate) expect_continue: bool,
    pub(crate) keep_alive: bool,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ParseStatus {
    /// The buffer does not yet hold a complete head.
    Incomplete,
    /// One head was consumed from the buffer.
    Head(ParsedHead),
}

#[derive(Debug, Clone)]
pub(crate) struct HeadParser {
    max_target_length: usize,
    max_header_size: usize,
}

impl HeadParser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            max_target_length: limits.max_target_length,
            max_header_size: limits.max_header_size,
        }
    }

    /// Attempts to parse one request head from the front of `buf`, consuming
    /// it on success. Empty lines preceding the request line are skipped.
    pub(crate) fn parse(&self, buf: &mut BytesMut) -> Result<ParseStatus, Error> {
        // Robustness: ignore CRLF noise between pipelined requests.
        loop {
            match buf.first() {
                Some(b'\n') => {
                    let _ = buf.split_to(1);
                }
                Some(b'\r') if buf.get(1) == Some(&b'\n') => {
                    let _ = buf.split_to(2);
                }
                Some(b'\r') if buf.len() == 1 => return Ok(ParseStatus::Incomplete),
                _ => break,
            }
        }

        let Some(head_len) = find_head_end(buf) else {
            return self.check_incomplete(buf);
        };
        if head_len > self.max_header_size {
            return Err(Error::HeaderTooLarge);
        }

        let head = buf.split_to(head_len).freeze();
        self.parse_complete(head).map(ParseStatus::Head)
    }

    fn check_incomplete(&self, buf: &BytesMut) -> Result<ParseStatus, Error> {
        if buf.len() > self.max_header_size {
            return Err(Error::HeaderTooLarge);
        }
        // A request line that keeps growing without a terminator is an
        // oversized target long before it is an oversized head.
        if memchr(b'\n', buf).is_none() && buf.len() > self.max_target_length + 64 {
            return Err(Error::TargetTooLong);
        }
        Ok(ParseStatus::Incomplete)
    }

    fn parse_complete(&self, head: Bytes) -> Result<ParsedHead, Error> {
        let mut lines = HeadLines::new(&head);

        let request_line = lines
            .next()
            .ok_or(Error::ClientProtocol("empty request head"))?;
        let (method, target, version) = self.parse_request_line(request_line)?;

        let mut headers = HeaderMap::new();
        for line in &mut lines {
            headers.headers.push(parse_header_line(&head, line)?);
        }

        let mut parsed = ParsedHead {
            method,
            target,
            version,
            headers,
            body: BodyKind::None,
            expect_continue: false,
            keep_alive: version == Version::Http11,
        };
        self.apply_special_headers(&mut parsed)?;

        Ok(parsed)
    }

    fn parse_request_line(&self, line: &[u8]) -> Result<(String, String, Version), Error> {
        let method_end = memchr(b' ', line).ok_or(Error::ClientProtocol("malformed request line"))?;
        let method = &line[..method_end];
        if !is_token(method) {
            return Err(Error::ClientProtocol("invalid method token"));
        }

        let rest = &line[method_end + 1..];
        let target_end = memchr(b' ', rest).ok_or(Error::ClientProtocol("malformed request line"))?;
        let target = &rest[..target_end];
        if target.len() > self.max_target_length {
            return Err(Error::TargetTooLong);
        }
        if target.is_empty() || !target.iter().all(|&b| (0x21..=0x7e).contains(&b)) {
            return Err(Error::ClientProtocol("invalid request target"));
        }

        let version_bytes = &rest[target_end + 1..];
        let version = match Version::from_bytes(version_bytes) {
            Some(v) => v,
            None if version_bytes.starts_with(b"HTTP/") => {
                return Err(Error::NotImplemented("unsupported HTTP version"));
            }
            None => return Err(Error::ClientProtocol("malformed HTTP version")),
        };

        // Both are plain ASCII at this point.
        let method = String::from_utf8(method.to_vec())
            .map_err(|_| Error::ClientProtocol("invalid method token"))?;
        let target = String::from_utf8(target.to_vec())
            .map_err(|_| Error::ClientProtocol("invalid request target"))?;

        Ok((method, target, version))
    }

    fn apply_special_headers(&self, parsed: &mut ParsedHead) -> Result<(), Error> {
        let mut content_length: Option<u64> = None;
        for value in parsed.headers.get_all("content-length") {
            let len = parse_u64_decimal(value)
                .ok_or(Error::ClientProtocol("invalid content-length"))?;
            if content_length.is_some_and(|prev| prev != len) {
                return Err(Error::ClientProtocol("conflicting content-length"));
            }
            content_length = Some(len);
        }

        let chunked = match parsed.headers.get("transfer-encoding") {
            None => false,
            Some(_) if parsed.version == Version::Http10 => {
                return Err(Error::ClientProtocol("transfer-encoding in HTTP/1.0"));
            }
            Some(value) if trim_ows(value).eq_ignore_ascii_case(b"chunked") => {
                if content_length.is_some() {
                    return Err(Error::ClientProtocol(
                        "both content-length and transfer-encoding",
                    ));
                }
                true
            }
            Some(_) => return Err(Error::NotImplemented("unsupported transfer coding")),
        };

        parsed.body = if chunked {
            BodyKind::Chunked
        } else {
            match content_length {
                Some(0) | None => BodyKind::None,
                Some(len) => BodyKind::Length(len),
            }
        };

        parsed.keep_alive = match parsed.version {
            Version::Http11 => !parsed.headers.has_list_token("connection", "close"),
            Version::Http10 => parsed.headers.has_list_token("connection", "keep-alive"),
        };

        // Only the 100-continue expectation is acted on; anything else a
        // client declares is ignored.
        parsed.expect_continue = parsed.version == Version::Http11
            && parsed
                .headers
                .get("expect")
                .is_some_and(|v| trim_ows(v).eq_ignore_ascii_case(b"100-continue"));

        Ok(())
    }
}

fn parse_header_line(head: &Bytes, line: &[u8]) -> Result<Header, Error> {
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(Error::ClientProtocol("obsolete header folding"));
    }

    let colon = memchr(b':', line).ok_or(Error::ClientProtocol("header line without colon"))?;
    let name = &line[..colon];
    if !is_token(name) {
        return Err(Error::ClientProtocol("invalid header name"));
    }

    let value = trim_ows(&line[colon + 1..]);
    let mut name = String::from_utf8(name.to_vec())
        .map_err(|_| Error::ClientProtocol("invalid header name"))?;
    name.make_ascii_lowercase();

    Ok(Header::new(name, head.slice_ref(value)))
}

/// Returns the total head length including the terminating empty line, if one
/// is present. Accepts both CRLF and bare LF line endings.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    for idx in memchr_iter(b'\n', buf) {
        match buf.get(idx + 1) {
            Some(b'\n') => return Some(idx + 2),
            Some(b'\r') if buf.get(idx + 2) == Some(&b'\n') => return Some(idx + 3),
            _ => {}
        }
    }
    None
}

/// Iterator over head lines with their endings stripped; stops at the empty
/// terminator line.
struct HeadLines<'a> {
    rest: &'a [u8],
}

impl<'a> HeadLines<'a> {
    fn new(head: &'a [u8]) -> Self {
        Self { rest: head }
    }
}

impl<'a> Iterator for HeadLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let end = memchr(b'\n', self.rest)?;
        let mut line = &self.rest[..end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        self.rest = &self.rest[end + 1..];
        if line.is_empty() {
            return None;
        }
        Some(line)
    }
}
