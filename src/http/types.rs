//! Core HTTP protocol types shared by the parser, request and response sides.

use bytes::Bytes;
use chrono::Utc;

#[inline(always)]
pub(crate) fn parse_u64_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as u64)?;
    }

    Some(result)
}

/// Trims optional whitespace (SP / HTAB) from both ends of a field value.
#[inline(always)]
pub(crate) fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// `token` per RFC 7230 section 3.2.6.
#[inline(always)]
pub(crate) fn is_token(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes.iter().all(|&b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
                b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
        })
}

/// Current date in IMF-fixdate form, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`.
#[inline]
pub(crate) fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// VERSION

/// HTTP protocol version of a request or response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0: no persistent connections unless negotiated, no chunked coding.
    Http10,
    /// HTTP/1.1: persistent connections by default, chunked transfer coding.
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Option<Self> {
        match src {
            b"HTTP/1.1" => Some(Self::Http11),
            b"HTTP/1.0" => Some(Self::Http10),
            _ => None,
        }
    }

    #[inline(always)]
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP response status codes.
        ///
        /// Codes are defined in [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15)
        /// and related standards. The numeric value of each variant is the wire code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            /// Numeric status code as sent on the wire.
            #[inline(always)]
            pub const fn code(self) -> u16 {
                self as u16
            }

            /// Default reason phrase for this status.
            #[inline]
            pub const fn reason(self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }
        }
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    ResetContent = (205, "Reset Content");
    PartialContent = (206, "Partial Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    NotAcceptable = (406, "Not Acceptable");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PreconditionFailed = (412, "Precondition Failed");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    ExpectationFailed = (417, "Expectation Failed");
    UpgradeRequired = (426, "Upgrade Required");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl StatusCode {
    /// Whether a response with this status never carries a body.
    #[inline(always)]
    pub(crate) const fn forbids_body(self) -> bool {
        matches!(
            self,
            StatusCode::Continue
                | StatusCode::SwitchingProtocols
                | StatusCode::NoContent
                | StatusCode::NotModified
        )
    }

    /// 2xx success class; a tunnel is only established on these.
    #[inline(always)]
    pub(crate) const fn is_success(self) -> bool {
        self.code() >= 200 && self.code() < 300
    }
}

// HEADER

/// A single request header field. The name is stored lowercased; the value is
/// the raw octets with surrounding whitespace trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub(crate) name: String,
    pub(crate) value: Bytes,
}

impl Header {
    #[inline(always)]
    pub(crate) fn new(name: String, value: Bytes) -> Self {
        Header { name, value }
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

// HEADER MAP

/// Parsed request headers, in arrival order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeaderMap {
    pub(crate) headers: Vec<Header>,
}

impl HeaderMap {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            headers: Vec::new(),
        }
    }

    /// Returns the first value for `name`, matched case-insensitively
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    /// Uses linear search.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_ref())
    }

    /// All values for `name`, in arrival order.
    #[inline]
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_ref())
    }

    /// Iterates over every header in arrival order.
    #[inline(always)]
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// True when `value` appears as a token of the comma-separated list header
    /// `name` (case-insensitive). Used for `Connection` option matching.
    #[inline]
    pub(crate) fn has_list_token(&self, name: &str, value: &str) -> bool {
        self.get_all(name).any(|v| {
            v.split(|&b| b == b',')
                .any(|part| trim_ows(part).eq_ignore_ascii_case(value.as_bytes()))
        })
    }
}
