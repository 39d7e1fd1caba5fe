//! Plain vs TLS transport behind one capability set.
//!
//! The connection core only needs `{read, write, shutdown}`; both socket
//! flavors provide them through `AsyncRead`/`AsyncWrite`, so the variants are
//! a plain enum with delegating poll impls.

use crate::limits::ConnLimits;
use bytes::Bytes;
use socket2::SockRef;
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::server::TlsStream;

/// Object-safe alias for anything the core can treat as a duplex byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An accepted client socket, optionally wrapped in server-side TLS.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    #[inline(always)]
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Transport::Plain(stream) => stream.peer_addr(),
            Transport::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Applies the configured send/receive buffer sizes to an accepted socket.
pub(crate) fn apply_socket_options(stream: &TcpStream, limits: &ConnLimits) -> io::Result<()> {
    let socket = SockRef::from(stream);
    if let Some(size) = limits.socket_send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = limits.socket_recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(())
}

/// Raw connection handed to a tunnel callback after a successful CONNECT
/// exchange. HTTP processing has stopped; the callback owns the socket.
pub struct Tunnel {
    /// The detached transport.
    pub io: Box<dyn AsyncStream>,
    /// Bytes the client sent past the request head, already read off the
    /// socket. Deliver these to the tunnel destination first.
    pub buffered: Bytes,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("buffered", &self.buffered.len())
            .finish()
    }
}
