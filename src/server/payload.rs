//! Payload pumping between the socket and the handler, both directions.
//!
//! Incoming: [`PayloadFeed`] decodes identity or chunked framing from the
//! connection's input buffer and delivers `Bytes` chunks to the handler's
//! [`PayloadReader`] over a bounded channel. The channel depth is the only
//! read-ahead: a handler that stops reading stops the socket.
//!
//! Outgoing: [`pump_body`] drains a response body source into the socket
//! under the framing the response head advertised.

use crate::{
    errors::Error,
    http::{
        chunked::{chunk_head, ChunkedDecoder, Decoded, CHUNK_END, LAST_CHUNK},
        parser::BodyKind,
        request::{ReqShared, RequestState},
        response::{Body, Framing},
    },
    server::connection::ConnShared,
    StatusCode,
};
use bytes::{Bytes, BytesMut};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
    sync::{mpsc, oneshot, Notify},
    time::Instant,
};

/// Chunks buffered between the socket and a slow handler.
const PAYLOAD_CHANNEL_DEPTH: usize = 8;

/// Bytes reserved in the input buffer ahead of each socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Interim response emitted before the first payload byte of an
/// `Expect: 100-continue` request is delivered.
pub(crate) const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Ask from the read side to the write side: put `CONTINUE_LINE` on the wire
/// for this request, at a response boundary, then ack.
pub(crate) struct Interim {
    pub(crate) req_id: u64,
    pub(crate) ack: oneshot::Sender<()>,
}

/// Handler-visible payload control bits shared with the feed.
#[derive(Default)]
pub(crate) struct PayloadCtrl {
    begun: AtomicBool,
    halted: AtomicBool,
    wake: Notify,
}

impl PayloadCtrl {
    fn begun(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

/// Streaming request payload handed to the application handler.
///
/// Chunks arrive in wire order; `None` is end of payload. After an `Err`
/// chunk the connection is going away and no further data will arrive.
pub struct PayloadReader {
    rx: mpsc::Receiver<Result<Bytes, Error>>,
    ctrl: Arc<PayloadCtrl>,
    shared: Arc<ReqShared>,
}

impl PayloadReader {
    /// Receives the next payload chunk, suspending until one is available.
    ///
    /// The first call marks the request as consuming its payload; for an
    /// `Expect: 100-continue` request this is what triggers the interim
    /// response.
    pub async fn data(&mut self) -> Option<Result<Bytes, Error>> {
        if !self.ctrl.begun.swap(true, Ordering::SeqCst) {
            self.shared.begin_payload();
            self.ctrl.wake.notify_waiters();
        }
        match self.rx.recv().await {
            None => {
                // Everything buffered has been consumed; settle the payload
                // phase even when the feed finished first.
                self.shared.payload_eof();
                None
            }
            chunk => chunk,
        }
    }

    /// Pauses payload delivery. While halted the connection does not watch
    /// the socket for input on this payload.
    pub fn halt(&self) {
        self.ctrl.halted.store(true, Ordering::SeqCst);
        self.ctrl.wake.notify_waiters();
    }

    /// Resumes payload delivery after [`halt`](PayloadReader::halt).
    pub fn resume(&self) {
        self.ctrl.halted.store(false, Ordering::SeqCst);
        self.ctrl.wake.notify_waiters();
    }

    pub fn is_halted(&self) -> bool {
        self.ctrl.halted()
    }
}

impl std::fmt::Debug for PayloadReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadReader")
            .field("halted", &self.ctrl.halted())
            .finish()
    }
}

/// Builds the connected (reader, feed) pair for one request payload.
pub(crate) fn payload_channel(
    kind: BodyKind,
    shared: Arc<ReqShared>,
    conn: Arc<ConnShared>,
    max_payload: u64,
    send_continue: bool,
    interim_tx: mpsc::Sender<Interim>,
) -> (PayloadReader, PayloadFeed) {
    let (tx, rx) = mpsc::channel(PAYLOAD_CHANNEL_DEPTH);
    let ctrl = Arc::new(PayloadCtrl::default());

    let reader = PayloadReader {
        rx,
        ctrl: ctrl.clone(),
        shared: shared.clone(),
    };
    let feed = PayloadFeed {
        framing: match kind {
            BodyKind::Length(len) => FeedFraming::Length { remaining: len },
            BodyKind::Chunked => FeedFraming::Chunked(ChunkedDecoder::new()),
            BodyKind::None => FeedFraming::Length { remaining: 0 },
        },
        tx: Some(tx),
        ctrl,
        shared,
        conn,
        max_payload,
        received: 0,
        send_continue,
        interim_tx,
    };

    (reader, feed)
}

enum FeedFraming {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
}

enum Piece {
    Data(Bytes),
    NeedMore,
    Eof,
}

/// Connection-side half of one request payload: decodes framing, enforces the
/// size limit, honors halt/continue, and falls back to discarding once the
/// handler has submitted its response or dropped the reader.
pub(crate) struct PayloadFeed {
    framing: FeedFraming,
    tx: Option<mpsc::Sender<Result<Bytes, Error>>>,
    ctrl: Arc<PayloadCtrl>,
    shared: Arc<ReqShared>,
    conn: Arc<ConnShared>,
    max_payload: u64,
    received: u64,
    send_continue: bool,
    interim_tx: mpsc::Sender<Interim>,
}

impl PayloadFeed {
    /// Drives this payload to its end (delivered or discarded). On success
    /// the request has advanced past its payload phase; on error the
    /// connection input is unusable.
    pub(crate) async fn run<IO: AsyncRead + Unpin>(
        mut self,
        input: &mut InputSource<'_, IO>,
    ) -> Result<(), Error> {
        if self.send_continue {
            self.continue_gate().await?;
        }

        loop {
            self.sync_discard();
            self.halt_gate().await?;

            match self.decode(input.buf)? {
                Piece::Data(chunk) => self.deliver(chunk).await?,
                Piece::Eof => break,
                Piece::NeedMore => {
                    if input.fill().await? == 0 {
                        return Err(Error::ClientProtocol("eof inside request payload"));
                    }
                }
            }
        }

        self.shared.payload_eof();
        self.tx = None;
        Ok(())
    }

    /// Holds payload consumption until the handler either starts reading
    /// (emit `100 Continue`, in response order, then proceed) or submits a
    /// final response (skip the interim entirely).
    async fn continue_gate(&mut self) -> Result<(), Error> {
        loop {
            let wake = self.ctrl.wake.notified();
            let changed = self.shared.changed.notified();

            if self.ctrl.begun() {
                break;
            }
            if self.shared.state() >= RequestState::SubmittedResponse {
                return Ok(());
            }

            tokio::select! {
                _ = wake => {}
                _ = changed => {}
                _ = self.conn.wait_close() => return Err(Error::ConnectionClosed),
            }
        }

        if self.shared.state() >= RequestState::SubmittedResponse
            || self.shared.sent_100_continue.swap(true, Ordering::SeqCst)
        {
            return Ok(());
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.interim_tx
            .send(Interim {
                req_id: self.shared.id,
                ack: ack_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        ack_rx.await.map_err(|_| Error::ConnectionClosed)?;

        tracing::trace!(request = %self.shared.label, "sent 100 continue");
        Ok(())
    }

    /// While halted the socket is not read for this payload. A submission
    /// arriving mid-halt flips the feed into discard mode and releases it.
    async fn halt_gate(&mut self) -> Result<(), Error> {
        while self.tx.is_some() && self.ctrl.halted() {
            let wake = self.ctrl.wake.notified();
            let changed = self.shared.changed.notified();

            if !self.ctrl.halted() {
                break;
            }
            if self.shared.state() >= RequestState::SubmittedResponse {
                self.tx = None;
                break;
            }

            tokio::select! {
                _ = wake => {}
                _ = changed => {}
                _ = self.conn.wait_close() => return Err(Error::ConnectionClosed),
            }
        }
        Ok(())
    }

    fn sync_discard(&mut self) {
        if self.tx.is_some() && self.shared.state() >= RequestState::SubmittedResponse {
            self.tx = None;
        }
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Piece, Error> {
        match &mut self.framing {
            FeedFraming::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(Piece::Eof);
                }
                if buf.is_empty() {
                    return Ok(Piece::NeedMore);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Piece::Data(buf.split_to(take).freeze()))
            }
            FeedFraming::Chunked(decoder) => match decoder.decode(buf)? {
                Decoded::Data(data) => Ok(Piece::Data(data)),
                Decoded::NeedMore => Ok(Piece::NeedMore),
                Decoded::Done => Ok(Piece::Eof),
            },
        }
    }

    async fn deliver(&mut self, chunk: Bytes) -> Result<(), Error> {
        self.received += chunk.len() as u64;
        if self.received > self.max_payload {
            self.shared.mark_failed(StatusCode::PayloadTooLarge);
            if let Some(tx) = &self.tx {
                let _ = tx.try_send(Err(Error::PayloadTooLarge));
            }
            return Err(Error::PayloadTooLarge);
        }

        let Some(tx) = self.tx.clone() else {
            return Ok(()); // discard mode
        };

        tokio::select! { biased;
            sent = tx.send(Ok(chunk)) => {
                if sent.is_err() {
                    // Handler dropped its reader; everything further is
                    // skipped on the input.
                    self.tx = None;
                }
            }
            _ = self.shared.wait_min(RequestState::SubmittedResponse) => {
                self.tx = None;
            }
            _ = self.conn.wait_close() => return Err(Error::ConnectionClosed),
        }
        Ok(())
    }
}

/// The connection's buffered socket input with its timers and close signal.
pub(crate) struct InputSource<'a, IO> {
    pub(crate) io: &'a mut ReadHalf<IO>,
    pub(crate) buf: &'a mut BytesMut,
    pub(crate) conn: Arc<ConnShared>,
    pub(crate) idle: Option<Duration>,
}

impl<IO: AsyncRead + Unpin> InputSource<'_, IO> {
    pub(crate) async fn fill(&mut self) -> Result<usize, Error> {
        self.fill_until(None).await
    }

    /// One socket read, bounded by the idle timer, an optional absolute
    /// deadline (the header-read timer) and the connection close signal.
    /// Returns the byte count; 0 is end of input.
    pub(crate) async fn fill_until(&mut self, deadline: Option<Instant>) -> Result<usize, Error> {
        self.buf.reserve(READ_CHUNK);

        tokio::select! { biased;
            _ = self.conn.wait_close() => Err(Error::ConnectionClosed),
            read = self.io.read_buf(self.buf) => match read {
                Ok(n) => {
                    self.conn.stats.add_bytes_in(n as u64);
                    Ok(n)
                }
                Err(err) => Err(Error::read(err)),
            },
            _ = sleep_opt(self.idle) => Err(Error::IdleTimeout),
            _ = sleep_until_opt(deadline) => Err(Error::IdleTimeout),
        }
    }
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Writes one response body under the framing its head advertised. Returns
/// the payload byte count (framing overhead excluded).
///
/// Bytes pumped must match an advertised `Content-Length` exactly; any
/// mismatch, including a declared length with no body behind it, is fatal
/// for the connection. (HEAD responses never reach this function.)
pub(crate) async fn pump_body<IO: AsyncWrite + Unpin>(
    io: &mut IO,
    body: Body,
    framing: Framing,
    conn: &ConnShared,
) -> Result<u64, Error> {
    let mut written: u64 = 0;

    match framing {
        Framing::Length(advertised) => match body {
            Body::Empty => {
                if advertised != 0 {
                    return Err(Error::PayloadEncoding {
                        advertised,
                        actual: 0,
                    });
                }
            }
            Body::Full(data) => {
                if data.len() as u64 != advertised {
                    return Err(Error::PayloadEncoding {
                        advertised,
                        actual: data.len() as u64,
                    });
                }
                write_piece(io, &data, conn).await?;
                written = data.len() as u64;
            }
            Body::Stream { mut rx, .. } => {
                while let Some(chunk) = rx.recv().await {
                    written += chunk.len() as u64;
                    if written > advertised {
                        return Err(Error::PayloadEncoding {
                            advertised,
                            actual: written,
                        });
                    }
                    write_piece(io, &chunk, conn).await?;
                    io.flush().await.map_err(Error::write)?;
                }
                if written != advertised {
                    return Err(Error::PayloadEncoding {
                        advertised,
                        actual: written,
                    });
                }
            }
        },
        Framing::Chunked => {
            match body {
                Body::Empty => {}
                Body::Full(data) => {
                    if !data.is_empty() {
                        write_piece(io, chunk_head(data.len()).as_bytes(), conn).await?;
                        write_piece(io, &data, conn).await?;
                        write_piece(io, CHUNK_END, conn).await?;
                        written = data.len() as u64;
                    }
                }
                Body::Stream { mut rx, .. } => {
                    while let Some(chunk) = rx.recv().await {
                        if chunk.is_empty() {
                            continue; // a zero-length chunk would end the body
                        }
                        written += chunk.len() as u64;
                        write_piece(io, chunk_head(chunk.len()).as_bytes(), conn).await?;
                        write_piece(io, &chunk, conn).await?;
                        write_piece(io, CHUNK_END, conn).await?;
                        io.flush().await.map_err(Error::write)?;
                    }
                }
            }
            write_piece(io, LAST_CHUNK, conn).await?;
        }
        Framing::CloseDelimited => match body {
            Body::Empty => {}
            Body::Full(data) => {
                write_piece(io, &data, conn).await?;
                written = data.len() as u64;
            }
            Body::Stream { mut rx, .. } => {
                while let Some(chunk) = rx.recv().await {
                    written += chunk.len() as u64;
                    write_piece(io, &chunk, conn).await?;
                    io.flush().await.map_err(Error::write)?;
                }
            }
        },
    }

    io.flush().await.map_err(Error::write)?;
    Ok(written)
}

async fn write_piece<IO: AsyncWrite + Unpin>(
    io: &mut IO,
    data: &[u8],
    conn: &ConnShared,
) -> Result<(), Error> {
    io.write_all(data).await.map_err(Error::write)?;
    conn.stats.add_bytes_out(data.len() as u64);
    Ok(())
}
