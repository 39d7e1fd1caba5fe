//! Connection and request limits.
//!
//! Defaults are conservative: they bound every buffer the connection core
//! allocates on behalf of a client and every interval it is willing to wait
//! for one. Timers default to disabled; size limits default to values that
//! fit typical API traffic.
//!
//! # Examples
//!
//! ```no_run
//! use quay_http::limits::{ConnLimits, ReqLimits, ServerLimits};
//! use std::time::Duration;
//!
//! let server = ServerLimits {
//!     max_pipelined_requests: 16,
//!     ..ServerLimits::default()
//! };
//! let conn = ConnLimits {
//!     max_client_idle_time: Some(Duration::from_secs(30)),
//!     ..ConnLimits::default()
//! };
//! let req = ReqLimits {
//!     max_payload_size: 8 * 1024 * 1024,
//!     ..ReqLimits::default()
//! };
//! # let _ = (server, conn, req);
//! ```

use std::time::Duration;

/// Server-wide behavior knobs shared by every connection.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Cap on requests in flight on one connection (default: `8`).
    ///
    /// When a client pipelines more requests than this, the connection stops
    /// reading from the socket until responses drain. Back-pressure, not an
    /// error.
    pub max_pipelined_requests: usize,

    /// Verbose per-connection logging (default: `false`).
    ///
    /// Raises the detail of `tracing` events emitted on the read and write
    /// paths. Filtering still belongs to the installed subscriber.
    pub debug: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_pipelined_requests: 8,
            debug: false,

            _priv: (),
        }
    }
}

/// Per-connection timers and socket options.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Idle timeout between bytes of client input (default: `None` = disabled).
    ///
    /// The timer resets on every byte received; firing closes the connection
    /// with reason "connection timed out".
    pub max_client_idle_time: Option<Duration>,

    /// Bound on the time from the first byte of a request to its complete
    /// head (default: `None` = disabled). Guards against trickled headers.
    pub header_read_timeout: Option<Duration>,

    /// `SO_SNDBUF` for accepted sockets (default: `None` = kernel default).
    pub socket_send_buffer_size: Option<usize>,

    /// `SO_RCVBUF` for accepted sockets (default: `None` = kernel default).
    pub socket_recv_buffer_size: Option<usize>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_client_idle_time: None,
            header_read_timeout: None,
            socket_send_buffer_size: None,
            socket_recv_buffer_size: None,

            _priv: (),
        }
    }
}

/// Request parsing limits.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request-target length in octets (default: `4096`).
    ///
    /// Longer targets are answered with `414 URI Too Long`.
    pub max_target_length: usize,

    /// Maximum size of a request head, request line and all header fields
    /// included (default: `32 KiB`).
    ///
    /// Exceeding it is answered with `431 Request Header Fields Too Large`.
    pub max_header_size: usize,

    /// Maximum request payload size in bytes after transfer decoding
    /// (default: `1 MiB`).
    ///
    /// Exceeding it is answered with `413 Payload Too Large` when no response
    /// was sent yet, and closes the connection otherwise.
    pub max_payload_size: u64,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_target_length: 4096,
            max_header_size: 32 * 1024,
            max_payload_size: 1024 * 1024,

            _priv: (),
        }
    }
}
