use crate::StatusCode;
use std::{error, fmt, io};

/// Everything that can go wrong while serving one connection.
///
/// Each variant carries its disposition: [`status`](Error::status) is the HTTP
/// status used when the error is answered on the wire, and
/// [`closes_connection`](Error::closes_connection) says whether the connection
/// must go down after (or instead of) that response.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// Malformed request head or body framing the client sent.
    ClientProtocol(&'static str),
    /// Request head exceeded the configured header-size limit.
    HeaderTooLarge,
    /// Request payload exceeded the configured payload-size limit.
    PayloadTooLarge,
    /// Request target longer than the configured maximum.
    TargetTooLong,
    /// Protocol feature the server rejects (e.g. an unknown transfer coding).
    NotImplemented(&'static str),
    /// Handler submitted conflicting headers, or no response at all.
    HandlerSubmit(&'static str),
    /// Body bytes pumped did not match the advertised `Content-Length`.
    PayloadEncoding { advertised: u64, actual: u64 },
    /// Socket or TLS read failure.
    TransportRead(IoError),
    /// Socket or TLS write failure.
    TransportWrite(IoError),
    /// No activity within the configured idle window.
    IdleTimeout,
    /// The connection was closed before the operation could complete.
    ConnectionClosed,
}

impl Error {
    #[inline(always)]
    pub(crate) fn read(err: io::Error) -> Self {
        Error::TransportRead(IoError(err))
    }

    #[inline(always)]
    pub(crate) fn write(err: io::Error) -> Self {
        Error::TransportWrite(IoError(err))
    }

    /// Status code of the synthesized response, for errors that are answered
    /// with one. Transport-level failures have nothing left to say.
    #[inline]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Error::ClientProtocol(_) => Some(StatusCode::BadRequest),
            Error::HeaderTooLarge => Some(StatusCode::RequestHeaderFieldsTooLarge),
            Error::PayloadTooLarge => Some(StatusCode::PayloadTooLarge),
            Error::TargetTooLong => Some(StatusCode::UriTooLong),
            Error::NotImplemented(_) => Some(StatusCode::NotImplemented),
            Error::HandlerSubmit(_) => Some(StatusCode::InternalServerError),
            Error::PayloadEncoding { .. }
            | Error::TransportRead(_)
            | Error::TransportWrite(_)
            | Error::IdleTimeout
            | Error::ConnectionClosed => None,
        }
    }

    /// Whether the connection must close once the error response (if any) is
    /// written. Errors local to one request that leave framing intact keep the
    /// connection open.
    #[inline]
    pub const fn closes_connection(&self) -> bool {
        match self {
            Error::NotImplemented(_) | Error::HandlerSubmit(_) => false,
            Error::ClientProtocol(_)
            | Error::HeaderTooLarge
            | Error::PayloadTooLarge
            | Error::TargetTooLong
            | Error::PayloadEncoding { .. }
            | Error::TransportRead(_)
            | Error::TransportWrite(_)
            | Error::IdleTimeout
            | Error::ConnectionClosed => true,
        }
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClientProtocol(msg) => write!(f, "client protocol error: {msg}"),
            Error::HeaderTooLarge => write!(f, "request header block too large"),
            Error::PayloadTooLarge => write!(f, "request payload too large"),
            Error::TargetTooLong => write!(f, "request target too long"),
            Error::NotImplemented(msg) => write!(f, "not implemented: {msg}"),
            Error::HandlerSubmit(msg) => write!(f, "handler submit error: {msg}"),
            Error::PayloadEncoding { advertised, actual } => write!(
                f,
                "payload encoding error: advertised {advertised} bytes, pumped {actual}"
            ),
            Error::TransportRead(err) => write!(f, "read failure: {}", err.0),
            Error::TransportWrite(err) => write!(f, "write failure: {}", err.0),
            Error::IdleTimeout => write!(f, "connection timed out"),
            Error::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

/// `io::Error` wrapper comparing by kind, so `Error` stays `PartialEq` for
/// case-table tests.
#[derive(Debug)]
pub struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Why a connection terminated. Delivered exactly once per connection through
/// [`Handler::connection_destroy`](crate::Handler::connection_destroy), and to
/// per-request destroy callbacks of requests that were still pending.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// Peer closed the connection.
    RemoteClosed,
    /// This side closed the connection after finishing its responses.
    Closed,
    /// Idle or header-read timer fired.
    Timeout,
    /// The server asked every live connection to shut down.
    ServerShutdown,
    /// Local failure; the string is the error description.
    Error(String),
}

impl DisconnectReason {
    #[inline]
    pub(crate) fn from_error(err: &Error) -> Self {
        match err {
            Error::IdleTimeout => DisconnectReason::Timeout,
            Error::ConnectionClosed => DisconnectReason::RemoteClosed,
            other => DisconnectReason::Error(other.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClosed => write!(f, "remote closed"),
            DisconnectReason::Closed => write!(f, "connection closed"),
            DisconnectReason::Timeout => write!(f, "connection timed out"),
            DisconnectReason::ServerShutdown => write!(f, "server shutting down"),
            DisconnectReason::Error(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        #[rustfmt::skip]
        let cases = [
            (Error::ClientProtocol("x"),  Some(StatusCode::BadRequest)),
            (Error::HeaderTooLarge,       Some(StatusCode::RequestHeaderFieldsTooLarge)),
            (Error::PayloadTooLarge,      Some(StatusCode::PayloadTooLarge)),
            (Error::TargetTooLong,        Some(StatusCode::UriTooLong)),
            (Error::NotImplemented("x"),  Some(StatusCode::NotImplemented)),
            (Error::HandlerSubmit("x"),   Some(StatusCode::InternalServerError)),
            (Error::IdleTimeout,          None),
            (Error::ConnectionClosed,     None),
        ];

        for (error, status) in cases {
            assert_eq!(error.status(), status, "{error}");
        }
    }

    #[test]
    fn close_disposition() {
        assert!(Error::ClientProtocol("x").closes_connection());
        assert!(Error::PayloadTooLarge.closes_connection());
        assert!(Error::TargetTooLong.closes_connection());
        assert!(Error::IdleTimeout.closes_connection());
        assert!(!Error::NotImplemented("x").closes_connection());
        assert!(!Error::HandlerSubmit("x").closes_connection());
    }

    #[test]
    fn io_error_compares_by_kind() {
        let a = Error::read(io::Error::new(io::ErrorKind::TimedOut, "a"));
        let b = Error::read(io::Error::new(io::ErrorKind::TimedOut, "b"));
        let c = Error::read(io::Error::new(io::ErrorKind::BrokenPipe, "c"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Error::write(io::Error::new(io::ErrorKind::TimedOut, "a")));
    }

    #[test]
    fn disconnect_reason_strings() {
        assert_eq!(DisconnectReason::RemoteClosed.to_string(), "remote closed");
        assert_eq!(DisconnectReason::Timeout.to_string(), "connection timed out");
        assert_eq!(
            DisconnectReason::from_error(&Error::IdleTimeout),
            DisconnectReason::Timeout
        );
        assert!(matches!(
            DisconnectReason::from_error(&Error::ClientProtocol("bad header")),
            DisconnectReason::Error(_)
        ));
    }
}
