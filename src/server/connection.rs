//! The per-connection state machine orchestrator.
//!
//! One connection runs two cooperating loops under a single task: the read
//! loop parses request heads, dispatches handlers and feeds request payloads;
//! the write loop serializes responses strictly in request-arrival order.
//! They share a [`ConnShared`] carrying the close signal, queue accounting
//! and statistics, and meet again at the end for the CONNECT tunnel handover.

use crate::{
    errors::{DisconnectReason, Error},
    http::{
        parser::{BodyKind, HeadParser, ParseStatus, ParsedHead},
        request::{ReqShared, Request, RequestIds, RequestState, Submission, TunnelCallback},
        response::{Body, Framing, Response},
        types::{http_date_now, Version},
    },
    limits::{ConnLimits, ReqLimits, ServerLimits},
    server::{
        payload::{payload_channel, pump_body, InputSource, Interim, CONTINUE_LINE},
        server_impl::Handler,
        transport::{AsyncStream, Tunnel},
    },
    StatusCode,
};
use bytes::BytesMut;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
    time::Instant,
};

/// Per-request events log at debug when the connection has verbose logging
/// enabled, trace otherwise.
macro_rules! conn_event {
    ($debug:expr, $($arg:tt)*) => {
        if $debug {
            tracing::debug!($($arg)*);
        } else {
            tracing::trace!($($arg)*);
        }
    };
}

/// Counters kept per connection.
#[derive(Debug, Default)]
pub struct ConnStats {
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ConnStats {
    pub(crate) fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// Connection state shared by the read loop, the write loop, payload feeds
/// and the connection list.
pub(crate) struct ConnShared {
    pub(crate) id: u64,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) tls: bool,
    close_flag: AtomicBool,
    close_notify: tokio::sync::Notify,
    reason: Mutex<Option<DisconnectReason>>,
    /// Parsing stopped after a protocol failure; queued requests still drain.
    pub(crate) input_broken: AtomicBool,
    /// No new requests are accepted; the connection closes once the queue
    /// drains.
    pub(crate) close_indicated: AtomicBool,
    /// A response payload is actively being written.
    pub(crate) output_locked: AtomicBool,
    /// The write loop flushed a tunnel response head; the socket is being
    /// handed over.
    pub(crate) tunneling: AtomicBool,
    pub(crate) queue_count: Arc<AtomicUsize>,
    pub(crate) stats: ConnStats,
}

impl ConnShared {
    pub(crate) fn new(id: u64, peer: Option<SocketAddr>, tls: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            tls,
            close_flag: AtomicBool::new(false),
            close_notify: tokio::sync::Notify::new(),
            reason: Mutex::new(None),
            input_broken: AtomicBool::new(false),
            close_indicated: AtomicBool::new(false),
            output_locked: AtomicBool::new(false),
            tunneling: AtomicBool::new(false),
            queue_count: Arc::new(AtomicUsize::new(0)),
            stats: ConnStats::default(),
        })
    }

    /// Requests connection teardown. The first reason wins; later callers
    /// only re-notify.
    pub(crate) fn request_close(&self, reason: DisconnectReason) {
        {
            let mut slot = self.reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.close_flag.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_close(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.close_flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn indicate_close(&self) {
        self.close_indicated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disconnect_reason(&self) -> DisconnectReason {
        self.reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(DisconnectReason::RemoteClosed)
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue_count.load(Ordering::SeqCst)
    }
}

/// Limits bundle one connection runs under.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionConfig {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
}

/// One entry of the response queue. The bounded channel carrying these IS the
/// request queue: arrival order in, response order out.
struct QueuedReq {
    shared: Arc<ReqShared>,
    version: Version,
    keep_alive: bool,
    /// The response head may advertise a body that is never transmitted.
    head_request: bool,
    resp_rx: oneshot::Receiver<Submission>,
}

struct ReadEnd<IO> {
    io: ReadHalf<IO>,
    buf: BytesMut,
}

struct WriteEnd<IO> {
    io: WriteHalf<IO>,
    exit: WriterExit,
}

enum WriterExit {
    Drained,
    Tunnel(TunnelCallback),
}

/// Drives one accepted connection until it closes or detaches as a tunnel.
pub(crate) async fn run_connection<IO, H>(
    io: IO,
    shared: Arc<ConnShared>,
    handler: Arc<H>,
    config: ConnectionConfig,
) where
    IO: AsyncStream + 'static,
    H: Handler,
{
    let debug = config.server.debug;
    conn_event!(
        debug,
        conn = shared.id,
        peer = ?shared.peer,
        tls = shared.tls,
        "connection started"
    );

    let (read_io, write_io) = tokio::io::split(io);
    let (req_tx, req_rx) = mpsc::channel(config.server.max_pipelined_requests.max(1));
    let (interim_tx, interim_rx) = mpsc::channel(1);

    let reader = ReadLoop {
        io: read_io,
        buf: BytesMut::with_capacity(8 * 1024),
        parser: HeadParser::new(&config.req),
        shared: shared.clone(),
        handler: handler.clone(),
        req_tx: Some(req_tx),
        interim_tx,
        ids: RequestIds::default(),
        conn_limits: config.conn,
        req_limits: config.req,
        debug,
    };
    let writer = WriteLoop {
        io: write_io,
        req_rx,
        interim_rx,
        interim_open: true,
        pending_interim: None,
        shared: shared.clone(),
        debug,
    };

    let (read_end, write_end) = tokio::join!(reader.run(), writer.run());

    if let WriterExit::Tunnel(callback) = write_end.exit {
        let io = read_end.io.unsplit(write_end.io);
        let tunnel = Tunnel {
            io: Box::new(io),
            buffered: read_end.buf.freeze(),
        };
        conn_event!(
            debug,
            conn = shared.id,
            buffered = tunnel.buffered.len(),
            "connection detached as tunnel"
        );
        callback(tunnel);
        return;
    }

    let mut write_io = write_end.io;
    let _ = write_io.shutdown().await;

    let reason = shared.disconnect_reason();
    conn_event!(
        debug,
        conn = shared.id,
        requests = shared.stats.requests(),
        bytes_in = shared.stats.bytes_in(),
        bytes_out = shared.stats.bytes_out(),
        %reason,
        "connection destroyed"
    );
    handler.connection_destroy(&reason);
}

/// Where an input failure happened, which decides who answers for it: before
/// dispatch the connection synthesizes the error response; after dispatch the
/// handler owns the exchange and the connection only stops parsing.
enum InputFault {
    BeforeDispatch(Error),
    AfterDispatch(Error),
}

struct ReadLoop<IO, H> {
    io: ReadHalf<IO>,
    buf: BytesMut,
    parser: HeadParser,
    shared: Arc<ConnShared>,
    handler: Arc<H>,
    req_tx: Option<mpsc::Sender<QueuedReq>>,
    interim_tx: mpsc::Sender<Interim>,
    ids: RequestIds,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    debug: bool,
}

impl<IO: AsyncStream, H: Handler> ReadLoop<IO, H> {
    async fn run(mut self) -> ReadEnd<IO> {
        loop {
            if self.shared.close_requested()
                || self.shared.close_indicated.load(Ordering::SeqCst)
                || self.shared.input_broken.load(Ordering::SeqCst)
            {
                break;
            }

            match self.serve_input().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(fault) => {
                    if !self.handle_input_fault(fault).await {
                        break;
                    }
                }
            }
        }

        drop(self.req_tx.take());
        ReadEnd {
            io: self.io,
            buf: self.buf,
        }
    }

    /// Parses one request, dispatches its handler and consumes its payload.
    /// `Ok(true)` means "keep going"; `Ok(false)` is an orderly stop.
    async fn serve_input(&mut self) -> Result<bool, InputFault> {
        let Some(head) = self.next_head().await? else {
            return Ok(false);
        };

        // An announced payload beyond the limit is rejected before the
        // handler ever runs, and before any 100-continue could go out.
        if let BodyKind::Length(len) = head.body {
            if len > self.req_limits.max_payload_size {
                return Err(InputFault::BeforeDispatch(Error::PayloadTooLarge));
            }
        }

        let id = self.ids.next();
        let label = head.label(id);
        conn_event!(self.debug, conn = self.shared.id, request = %label, "request head parsed");

        let req_shared = ReqShared::new(id, self.shared.id, label, self.shared.queue_count.clone());
        req_shared.advance(RequestState::Queued);

        let version = head.version;
        let keep_alive = head.keep_alive;
        let expect_continue = head.expect_continue;
        let is_connect = head.method == "CONNECT";
        let head_request = head.method == "HEAD";

        let (sub_tx, sub_rx) = oneshot::channel();
        let (payload, feed) = match head.body {
            BodyKind::None => {
                req_shared.body_complete.store(true, Ordering::SeqCst);
                (None, None)
            }
            kind => {
                let (reader, feed) = payload_channel(
                    kind,
                    req_shared.clone(),
                    self.shared.clone(),
                    self.req_limits.max_payload_size,
                    expect_continue,
                    self.interim_tx.clone(),
                );
                (Some(reader), Some(feed))
            }
        };

        let request = Request::new(
            head,
            req_shared.clone(),
            payload,
            sub_tx,
            if is_connect {
                StatusCode::NotImplemented
            } else {
                StatusCode::InternalServerError
            },
        );

        let queued = QueuedReq {
            shared: req_shared.clone(),
            version,
            keep_alive,
            head_request,
            resp_rx: sub_rx,
        };
        let Some(req_tx) = self.req_tx.as_ref() else {
            return Ok(false);
        };
        if req_tx.send(queued).await.is_err() {
            return Ok(false);
        }
        self.shared.stats.count_request();

        let handler = self.handler.clone();
        if is_connect {
            tokio::spawn(async move {
                let _ = handler.handle_connect(request).await;
            });
        } else {
            tokio::spawn(async move {
                handler.handle(request).await;
            });
        }

        // Request payloads are sequential on the wire: this one must be
        // consumed (or discarded) before the next head can be parsed.
        if let Some(feed) = feed {
            let mut input = InputSource {
                io: &mut self.io,
                buf: &mut self.buf,
                conn: self.shared.clone(),
                idle: self.conn_limits.max_client_idle_time,
            };
            if let Err(err) = feed.run(&mut input).await {
                // Settle the payload phase so the write loop is never left
                // waiting for a discard that cannot happen.
                req_shared.body_complete.store(true, Ordering::SeqCst);
                req_shared.payload_eof();
                return Err(InputFault::AfterDispatch(err));
            }
        }

        if is_connect {
            // Bytes following a CONNECT head belong to the tunnel, never to
            // the HTTP parser. Hold until the exchange settles.
            tokio::select! {
                _ = req_shared.wait_terminal() => {}
                _ = self.shared.wait_close() => {}
            }
            if self.shared.tunneling.load(Ordering::SeqCst) || self.shared.close_requested() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn next_head(&mut self) -> Result<Option<ParsedHead>, InputFault> {
        let mut head_deadline: Option<Instant> = None;

        loop {
            match self.parser.parse(&mut self.buf) {
                Ok(ParseStatus::Head(head)) => return Ok(Some(head)),
                Ok(ParseStatus::Incomplete) => {}
                Err(err) => return Err(InputFault::BeforeDispatch(err)),
            }

            if head_deadline.is_none() && !self.buf.is_empty() {
                head_deadline = self
                    .conn_limits
                    .header_read_timeout
                    .map(|timeout| Instant::now() + timeout);
            }

            let read = {
                let mut input = InputSource {
                    io: &mut self.io,
                    buf: &mut self.buf,
                    conn: self.shared.clone(),
                    idle: self.conn_limits.max_client_idle_time,
                };
                input.fill_until(head_deadline).await
            };

            match read {
                Ok(0) => {
                    // Peer ended the input. The close signal aborts whatever
                    // is still queued.
                    let pending = self.shared.queue_len();
                    if pending > 0 {
                        tracing::debug!(
                            conn = self.shared.id,
                            pending,
                            "remote closed with requests pending"
                        );
                    }
                    self.shared.request_close(DisconnectReason::RemoteClosed);
                    return Ok(None);
                }
                Ok(_) => {
                    if head_deadline.is_none() {
                        head_deadline = self
                            .conn_limits
                            .header_read_timeout
                            .map(|timeout| Instant::now() + timeout);
                    }
                }
                Err(Error::ConnectionClosed) => return Ok(None),
                Err(err) => return Err(InputFault::BeforeDispatch(err)),
            }
        }
    }

    /// Returns whether the read loop may keep parsing after the fault.
    async fn handle_input_fault(&mut self, fault: InputFault) -> bool {
        match fault {
            InputFault::BeforeDispatch(err) => match err {
                Error::ConnectionClosed => false,
                Error::TransportRead(_) | Error::IdleTimeout => {
                    tracing::debug!(conn = self.shared.id, %err, "input failed");
                    self.shared.request_close(DisconnectReason::from_error(&err));
                    false
                }
                err => {
                    // Protocol failure with nothing dispatched: answer it
                    // ourselves. The error's own disposition decides whether
                    // the input stays usable; a 501 keeps the connection,
                    // anything framing-corrupting stops it.
                    tracing::debug!(conn = self.shared.id, %err, "rejecting request");
                    let closes = err.closes_connection();
                    if closes {
                        self.shared.input_broken.store(true, Ordering::SeqCst);
                    }
                    self.fail_request(err).await;
                    !closes
                }
            },
            InputFault::AfterDispatch(err) => match err {
                Error::ConnectionClosed => false,
                Error::TransportRead(_) | Error::IdleTimeout => {
                    tracing::debug!(conn = self.shared.id, %err, "payload read failed");
                    self.shared.request_close(DisconnectReason::from_error(&err));
                    false
                }
                err => {
                    // The handler owns the exchange and has seen the error on
                    // its payload stream. Mid-payload failures leave the body
                    // position unknown, so parsing cannot resume regardless
                    // of the error's disposition; the write loop forces
                    // `Connection: close` on everything after.
                    tracing::debug!(conn = self.shared.id, %err, "request payload broken");
                    self.shared.input_broken.store(true, Ordering::SeqCst);
                    false
                }
            },
        }
    }

    /// Synthesizes an error response for a request the handler never saw and
    /// queues it like any other, so pipelined predecessors still answer
    /// first.
    async fn fail_request(&mut self, err: Error) {
        let status = err.status().unwrap_or(StatusCode::BadRequest);
        let close = err.closes_connection();
        let id = self.ids.next();
        let req_shared = ReqShared::new(
            id,
            self.shared.id,
            format!("[Req{id}: <failed>]"),
            self.shared.queue_count.clone(),
        );
        req_shared.advance(RequestState::Queued);
        req_shared.body_complete.store(true, Ordering::SeqCst);
        req_shared.mark_failed(status);
        if req_shared.mark_submitted().is_err() {
            return;
        }

        let mut response = Response::new(status);
        response.header("content-type", "text/plain");
        response.body_bytes(format!("{} {}\r\n", status.code(), status.reason()));
        if close {
            response.close();
        }

        let (sub_tx, sub_rx) = oneshot::channel();
        let _ = sub_tx.send(Submission {
            response,
            tunnel: None,
        });

        if let Some(req_tx) = self.req_tx.as_ref() {
            let _ = req_tx
                .send(QueuedReq {
                    shared: req_shared,
                    version: Version::Http11,
                    keep_alive: !close,
                    head_request: false,
                    resp_rx: sub_rx,
                })
                .await;
        }
    }
}

enum ServeOutcome {
    Next,
    Tunnel(TunnelCallback),
    Stop,
}

struct WriteLoop<IO> {
    io: WriteHalf<IO>,
    req_rx: mpsc::Receiver<QueuedReq>,
    interim_rx: mpsc::Receiver<Interim>,
    interim_open: bool,
    pending_interim: Option<Interim>,
    shared: Arc<ConnShared>,
    debug: bool,
}

impl<IO: AsyncStream> WriteLoop<IO> {
    async fn run(mut self) -> WriteEnd<IO> {
        let exit = loop {
            let queued = if self.shared.close_indicated.load(Ordering::SeqCst) {
                // No new requests are coming; serve what is already queued
                // and stop.
                match self.req_rx.try_recv() {
                    Ok(queued) => queued,
                    Err(_) => break WriterExit::Drained,
                }
            } else {
                tokio::select! { biased;
                    _ = self.shared.wait_close() => break WriterExit::Drained,
                    interim = self.interim_rx.recv(), if self.interim_open => {
                        match interim {
                            Some(interim) => self.pending_interim = Some(interim),
                            None => self.interim_open = false,
                        }
                        continue;
                    }
                    queued = self.req_rx.recv() => match queued {
                        Some(queued) => queued,
                        None => break WriterExit::Drained,
                    },
                }
            };

            match self.serve(queued).await {
                Ok(ServeOutcome::Next) => {}
                Ok(ServeOutcome::Tunnel(callback)) => break WriterExit::Tunnel(callback),
                Ok(ServeOutcome::Stop) => break WriterExit::Drained,
                Err(err) => {
                    tracing::debug!(conn = self.shared.id, %err, "write path failed");
                    self.shared.request_close(DisconnectReason::from_error(&err));
                    break WriterExit::Drained;
                }
            }
        };

        if !matches!(exit, WriterExit::Tunnel(_)) {
            self.shared.request_close(DisconnectReason::Closed);
        }

        // Cancel whatever never got its turn.
        self.req_rx.close();
        while let Ok(queued) = self.req_rx.try_recv() {
            queued.shared.abort();
        }

        WriteEnd { io: self.io, exit }
    }

    /// Serves the queue head: waits for its submission, skips its leftover
    /// request payload, writes the head and pumps the body. Strictly one
    /// request at a time, so pipelined responses never interleave.
    async fn serve(&mut self, mut queued: QueuedReq) -> Result<ServeOutcome, Error> {
        let result = self.serve_inner(&mut queued).await;
        if result.is_err() {
            // The response path failed mid-exchange; the request can never
            // finish, so settle it here before the connection goes down.
            queued.shared.abort();
        }
        result
    }

    async fn serve_inner(&mut self, queued: &mut QueuedReq) -> Result<ServeOutcome, Error> {
        self.flush_interim(queued.shared.id).await?;

        let submission = loop {
            tokio::select! { biased;
                _ = self.shared.wait_close() => {
                    queued.shared.abort();
                    return Ok(ServeOutcome::Stop);
                }
                interim = self.interim_rx.recv(), if self.interim_open => {
                    match interim {
                        Some(interim) => self.note_interim(interim, queued.shared.id).await?,
                        None => self.interim_open = false,
                    }
                }
                result = &mut queued.resp_rx => match result {
                    Ok(submission) => break submission,
                    Err(_) => {
                        // The exchange was aborted before anything was
                        // submitted; nothing goes on the wire.
                        queued.shared.abort();
                        return Ok(ServeOutcome::Next);
                    }
                },
            }
        };

        // The response may only start once the request payload is fully read
        // or discarded.
        let state = tokio::select! { biased;
            _ = self.shared.wait_close() => {
                queued.shared.abort();
                return Ok(ServeOutcome::Stop);
            }
            state = queued.shared.wait_min(RequestState::ReadyToRespond) => state,
        };
        if state == RequestState::Aborted {
            return Ok(ServeOutcome::Next);
        }

        let mut response = submission.response;
        let mut tunnel = submission.tunnel;
        if tunnel.is_some() {
            response.set_tunnel_head();
        }

        let mut keep_alive = queued.keep_alive
            && !response.wants_close()
            && !self.shared.input_broken.load(Ordering::SeqCst)
            && !self.shared.close_indicated.load(Ordering::SeqCst)
            && tunnel.is_none();

        let encoded = response.encode_head(queued.version, keep_alive, &http_date_now());
        let (head, framing) = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(
                    conn = self.shared.id,
                    request = %queued.shared.label,
                    %err,
                    "handler submitted an invalid response"
                );
                queued.shared.mark_failed(StatusCode::InternalServerError);
                tunnel = None;
                keep_alive = keep_alive && !err.closes_connection();
                let mut fallback = Response::new(StatusCode::InternalServerError);
                if !keep_alive {
                    fallback.close();
                }
                let encoded = fallback.encode_head(queued.version, keep_alive, &http_date_now())?;
                response = fallback;
                encoded
            }
        };

        self.io.write_all(&head).await.map_err(Error::write)?;
        self.shared.stats.add_bytes_out(head.len() as u64);
        queued.shared.advance(RequestState::SentResponse);

        if let Some(callback) = tunnel {
            self.io.flush().await.map_err(Error::write)?;
            queued.shared.advance(RequestState::Finished);
            self.shared.tunneling.store(true, Ordering::SeqCst);
            self.shared.indicate_close();
            return Ok(ServeOutcome::Tunnel(callback));
        }

        // A HEAD response's head may advertise Content-Length or a transfer
        // coding while no body bytes follow. Every other response must match
        // its framing exactly; pump_body enforces that, including a declared
        // length with no body behind it.
        let body = if queued.head_request {
            Body::Empty
        } else {
            response.take_body()
        };
        let direct = matches!(body, Body::Empty) && framing == Framing::Length(0);

        if queued.head_request || direct {
            self.io.flush().await.map_err(Error::write)?;
            queued.shared.advance(RequestState::Finished);
        } else {
            queued.shared.advance(RequestState::PayloadOut);
            self.shared.output_locked.store(true, Ordering::SeqCst);
            let pumped = pump_body(&mut self.io, body, framing, &self.shared).await;
            self.shared.output_locked.store(false, Ordering::SeqCst);
            pumped?;
            queued.shared.advance(RequestState::Finished);
        }
        conn_event!(
            self.debug,
            conn = self.shared.id,
            request = %queued.shared.label,
            status = response.status().code(),
            "response sent"
        );

        if framing == Framing::CloseDelimited {
            // The body's end is the connection's end.
            self.shared.indicate_close();
            return Ok(ServeOutcome::Stop);
        }
        if !keep_alive {
            // No new requests; already-queued ones still drain.
            self.shared.indicate_close();
        }
        Ok(ServeOutcome::Next)
    }

    /// Emits a stashed interim once its request reaches the queue head; one
    /// for a later pipelined request keeps waiting, one for a request that
    /// no longer exists is dropped.
    async fn flush_interim(&mut self, current: u64) -> Result<(), Error> {
        if let Some(interim) = self.pending_interim.take() {
            if interim.req_id == current {
                self.write_interim(interim).await?;
            } else if interim.req_id > current {
                self.pending_interim = Some(interim);
            }
        }
        Ok(())
    }

    async fn note_interim(&mut self, interim: Interim, current: u64) -> Result<(), Error> {
        if interim.req_id == current {
            self.write_interim(interim).await
        } else if interim.req_id > current {
            self.pending_interim = Some(interim);
            Ok(())
        } else {
            Ok(())
        }
    }

    async fn write_interim(&mut self, interim: Interim) -> Result<(), Error> {
        self.io
            .write_all(CONTINUE_LINE)
            .await
            .map_err(Error::write)?;
        self.io.flush().await.map_err(Error::write)?;
        self.shared.stats.add_bytes_out(CONTINUE_LINE.len() as u64);
        let _ = interim.ack.send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{future::Future, time::Duration};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    type Reasons = Arc<Mutex<Vec<String>>>;

    struct ScriptHandler<F> {
        script: F,
        reasons: Reasons,
    }

    impl<F, Fut> Handler for ScriptHandler<F>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        fn handle(&self, request: Request) -> impl Future<Output = ()> + Send {
            (self.script)(request)
        }

        fn connection_destroy(&self, reason: &DisconnectReason) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    fn script<F, Fut>(script: F) -> (ScriptHandler<F>, Reasons)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let reasons = Reasons::default();
        (
            ScriptHandler {
                script,
                reasons: reasons.clone(),
            },
            reasons,
        )
    }

    struct TestConn {
        client: DuplexStream,
        shared: Arc<ConnShared>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start<H: Handler>(handler: H) -> TestConn {
        let (client, server) = duplex(256 * 1024);
        let shared = ConnShared::new(1, None, false);
        let task = tokio::spawn(run_connection(
            server,
            shared.clone(),
            Arc::new(handler),
            ConnectionConfig::default(),
        ));
        TestConn {
            client,
            shared,
            task,
        }
    }

    async fn read_until(client: &mut DuplexStream, needle: &[u8]) -> String {
        let mut out: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if out.windows(needle.len()).any(|window| window == needle) {
                return String::from_utf8_lossy(&out).into_owned();
            }
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut chunk))
                .await
                .expect("timed out waiting for response bytes")
                .unwrap();
            assert!(
                n > 0,
                "eof before expected bytes; got {:?}",
                String::from_utf8_lossy(&out)
            );
            out.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_to_eof(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn pipelined_responses_follow_arrival_order() {
        let (handler, _reasons) = script(|req: Request| async move {
            // The first request finishes last inside the handler; the wire
            // order must not care.
            if req.target() == "/a" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let name = req.target()[1..].to_string();
            let mut resp = Response::new(StatusCode::Ok);
            resp.body_bytes(format!("answer-{name}"));
            let _ = req.respond(resp);
        });
        let mut conn = start(handler);

        conn.client
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let wire = read_until(&mut conn.client, b"answer-b").await;
        let a = wire.find("answer-a").expect("response to /a missing");
        let b = wire.find("answer-b").expect("response to /b missing");
        assert!(a < b, "responses out of order: {wire}");
        assert_eq!(wire.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(!wire.contains("connection: close"));

        // Still keep-alive: a third request round-trips.
        conn.client
            .write_all(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        read_until(&mut conn.client, b"answer-c").await;
        assert_eq!(conn.shared.queue_len(), 0);
        assert_eq!(conn.shared.stats.requests(), 3);
        assert!(!conn.shared.output_locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn oversized_announced_payload_rejected_without_continue() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let (handler, reasons) = script(move |req: Request| {
            flag.store(true, Ordering::SeqCst);
            async move { drop(req) }
        });
        let mut conn = start(handler);

        conn.client
            .write_all(
                b"PUT /x HTTP/1.1\r\nHost: x\r\nContent-Length: 10000000\r\nExpect: 100-continue\r\n\r\n",
            )
            .await
            .unwrap();

        let wire = read_to_eof(&mut conn.client).await;
        assert!(
            wire.starts_with("HTTP/1.1 413 Payload Too Large\r\n"),
            "{wire}"
        );
        assert!(wire.contains("connection: close\r\n"));
        assert!(!wire.contains("100 Continue"));
        assert!(!invoked.load(Ordering::SeqCst), "handler must not run");

        conn.task.await.unwrap();
        assert_eq!(reasons.lock().unwrap().as_slice(), ["connection closed"]);
        assert_eq!(conn.shared.queue_len(), 0);
    }

    #[tokio::test]
    async fn chunked_upload_halt_and_resume() {
        let (handler, _reasons) = script(|mut req: Request| async move {
            let mut payload = req.take_payload().expect("chunked request has payload");
            let mut received = Vec::new();
            let mut halted_once = false;
            while let Some(chunk) = payload.data().await {
                received.extend_from_slice(&chunk.unwrap());
                if !halted_once && received.len() >= 4096 {
                    halted_once = true;
                    payload.halt();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    payload.resume();
                }
            }

            let expected: Vec<u8> = (0..16u8).flat_map(|i| vec![i; 1024]).collect();
            let mut resp = Response::new(StatusCode::Ok);
            resp.body_bytes(if received == expected {
                format!("in-order {}", received.len())
            } else {
                "corrupted".to_string()
            });
            let _ = req.respond(resp);
        });
        let mut conn = start(handler);

        let mut upload = Vec::new();
        upload.extend_from_slice(b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        for i in 0..16u8 {
            upload.extend_from_slice(format!("{:x}\r\n", 1024).as_bytes());
            upload.extend_from_slice(&vec![i; 1024]);
            upload.extend_from_slice(b"\r\n");
        }
        upload.extend_from_slice(b"0\r\n\r\n");
        conn.client.write_all(&upload).await.unwrap();

        let wire = read_until(&mut conn.client, b"in-order 16384").await;
        assert!(wire.contains("HTTP/1.1 200 OK"), "{wire}");
    }

    #[tokio::test]
    async fn http10_unknown_length_body_is_close_delimited() {
        let (handler, reasons) = script(|req: Request| async move {
            let mut writer = req
                .respond_writer(Response::new(StatusCode::Ok))
                .expect("submit streamed response");
            writer.write("part-one").await.unwrap();
            writer.write("part-two").await.unwrap();
            writer.finish();
        });
        let mut conn = start(handler);

        conn.client
            .write_all(b"GET /dl HTTP/1.0\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let wire = read_to_eof(&mut conn.client).await;
        assert!(wire.starts_with("HTTP/1.0 200 OK\r\n"), "{wire}");
        assert!(wire.contains("connection: close\r\n"));
        assert!(!wire.contains("content-length"));
        assert!(!wire.contains("transfer-encoding"));
        assert!(wire.ends_with("part-onepart-two"), "{wire}");

        conn.task.await.unwrap();
        assert_eq!(reasons.lock().unwrap().len(), 1);
    }

    struct TunnelHandler {
        destroyed: Arc<AtomicBool>,
    }

    impl Handler for TunnelHandler {
        async fn handle(&self, _request: Request) {}

        async fn handle_connect(&self, req: Request) -> bool {
            let mut resp = Response::new(StatusCode::Ok);
            resp.reason("Connection Established");
            req.respond_tunnel(resp, |tunnel| {
                // Blind byte relay: echo whatever arrives, starting with the
                // bytes the client sent past the CONNECT head.
                tokio::spawn(async move {
                    let Tunnel { mut io, buffered } = tunnel;
                    io.write_all(&buffered).await.unwrap();
                    let mut buf = [0u8; 256];
                    loop {
                        let n = io.read(&mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        io.write_all(&buf[..n]).await.unwrap();
                    }
                });
            })
            .unwrap();
            true
        }

        fn connection_destroy(&self, _reason: &DisconnectReason) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn connect_tunnel_handover() {
        let destroyed = Arc::new(AtomicBool::new(false));
        let mut conn = start(TunnelHandler {
            destroyed: destroyed.clone(),
        });

        conn.client
            .write_all(b"CONNECT host:443 HTTP/1.1\r\nHost: host:443\r\n\r\nearly")
            .await
            .unwrap();

        let wire = read_until(&mut conn.client, b"early").await;
        assert!(
            wire.starts_with("HTTP/1.1 200 Connection Established\r\n"),
            "{wire}"
        );
        assert!(!wire.contains("content-length"));
        assert!(!wire.contains("connection:"));
        assert!(wire.ends_with("\r\n\r\nearly"), "{wire}");

        // The relay is live in both directions; HTTP parsing is over.
        conn.client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let echoed = read_until(&mut conn.client, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(!echoed.contains("HTTP/1.1 200"), "{echoed}");

        conn.task.await.unwrap();
        assert!(!destroyed.load(Ordering::SeqCst), "tunnels are not destroyed");
    }

    #[tokio::test]
    async fn premature_disconnect_aborts_pending_requests() {
        let held: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));
        let held2 = held.clone();
        let aborted = Arc::new(AtomicBool::new(false));
        let aborted2 = aborted.clone();
        let (handler, reasons) = script(move |req: Request| {
            let held = held2.clone();
            let aborted = aborted2.clone();
            async move {
                if req.target() == "/one" {
                    let mut resp = Response::new(StatusCode::Ok);
                    resp.body_bytes("first");
                    let _ = req.respond(resp);
                } else {
                    req.on_destroy(move || aborted.store(true, Ordering::SeqCst));
                    *held.lock().unwrap() = Some(req);
                }
            }
        });
        let mut conn = start(handler);

        conn.client
            .write_all(b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        read_until(&mut conn.client, b"first").await;

        drop(conn.client);
        conn.task.await.unwrap();

        assert_eq!(reasons.lock().unwrap().as_slice(), ["remote closed"]);
        assert!(aborted.load(Ordering::SeqCst), "pending request not aborted");
        let held = held.lock().unwrap();
        assert_eq!(held.as_ref().map(Request::state), Some(RequestState::Aborted));
        assert_eq!(conn.shared.queue_len(), 0);
    }

    #[tokio::test]
    async fn not_implemented_is_answered_and_parsing_continues() {
        let (handler, _reasons) = script(|req: Request| async move {
            let name = req.target()[1..].to_string();
            let mut resp = Response::new(StatusCode::Ok);
            resp.body_bytes(format!("answer-{name}"));
            let _ = req.respond(resp);
        });
        let mut conn = start(handler);

        conn.client
            .write_all(
                b"GET /ok HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /v2 HTTP/2.0\r\n\r\n\
                  GET /again HTTP/1.1\r\nHost: x\r\n\r\n",
            )
            .await
            .unwrap();

        let wire = read_until(&mut conn.client, b"answer-again").await;
        let ok = wire.find("answer-ok").expect("first response missing");
        let rejected = wire.find("501 Not Implemented").expect("501 missing");
        let again = wire.find("answer-again").expect("third response missing");
        assert!(ok < rejected && rejected < again, "{wire}");
        assert!(!wire.contains("connection: close"), "{wire}");
        assert_eq!(conn.shared.queue_len(), 0);
    }

    #[tokio::test]
    async fn head_response_advertises_body_without_sending_it() {
        let (handler, _reasons) = script(|req: Request| async move {
            let mut resp = Response::new(StatusCode::Ok);
            if req.method() == "HEAD" {
                resp.header("content-length", "1234");
            } else {
                resp.body_bytes("after-body");
            }
            let _ = req.respond(resp);
        });
        let mut conn = start(handler);

        conn.client
            .write_all(b"HEAD /f HTTP/1.1\r\nHost: x\r\n\r\nGET /g HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let wire = read_until(&mut conn.client, b"after-body").await;
        assert!(wire.contains("content-length: 1234\r\n"), "{wire}");
        // The advertised 1234 bytes are never sent: the HEAD response's head
        // is followed directly by the next response.
        assert!(wire.contains("\r\n\r\nHTTP/1.1 200 OK\r\n"), "{wire}");
        assert_eq!(wire.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn declared_length_without_body_closes_connection() {
        let (handler, reasons) = script(|req: Request| async move {
            let mut resp = Response::new(StatusCode::Ok);
            resp.header("content-length", "10");
            let _ = req.respond(resp);
        });
        let mut conn = start(handler);

        conn.client
            .write_all(b"GET /broken HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        // The head goes out claiming ten bytes, then the mismatch is caught
        // and the connection can only close.
        let wire = read_to_eof(&mut conn.client).await;
        assert!(wire.contains("content-length: 10\r\n"), "{wire}");
        assert!(wire.ends_with("\r\n\r\n"), "{wire}");

        conn.task.await.unwrap();
        let reasons = reasons.lock().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("payload encoding error"), "{reasons:?}");
        assert_eq!(conn.shared.queue_len(), 0);
    }

    #[tokio::test]
    async fn continue_line_precedes_payload_delivery_exactly_once() {
        let (handler, _reasons) = script(|mut req: Request| async move {
            let mut payload = req.take_payload().expect("payload");
            let mut total = 0usize;
            while let Some(chunk) = payload.data().await {
                total += chunk.unwrap().len();
            }
            let mut resp = Response::new(StatusCode::Ok);
            resp.body_bytes(format!("got {total}"));
            let _ = req.respond(resp);
        });
        let mut conn = start(handler);

        conn.client
            .write_all(
                b"PUT /up HTTP/1.1\r\nHost: x\r\nContent-Length: 6\r\nExpect: 100-continue\r\n\r\n",
            )
            .await
            .unwrap();

        // The interim goes out before any payload byte is transmitted.
        let interim = read_until(&mut conn.client, b"HTTP/1.1 100 Continue\r\n\r\n").await;
        assert_eq!(interim.matches("100 Continue").count(), 1);
        assert!(!interim.contains("200"));

        conn.client.write_all(b"abcdef").await.unwrap();
        let wire = read_until(&mut conn.client, b"got 6").await;
        assert_eq!(wire.matches("100 Continue").count(), 0);
        assert!(wire.contains("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn malformed_pipeline_drains_then_closes() {
        let (handler, _reasons) = script(|req: Request| async move {
            let mut resp = Response::new(StatusCode::Ok);
            resp.body_bytes("fine");
            let _ = req.respond(resp);
        });
        let mut conn = start(handler);

        conn.client
            .write_all(b"GET /ok HTTP/1.1\r\nHost: x\r\n\r\nGARBAGE\r\n\r\n")
            .await
            .unwrap();

        let wire = read_to_eof(&mut conn.client).await;
        let ok = wire.find("fine").expect("first response missing");
        let bad = wire.find("400 Bad Request").expect("error response missing");
        assert!(ok < bad, "queued request answered after the failure: {wire}");
        assert!(wire.contains("connection: close"));
    }

    #[tokio::test]
    async fn idle_timeout_closes_with_timeout_reason() {
        let (handler, reasons) = script(|req: Request| async move {
            let mut resp = Response::new(StatusCode::Ok);
            resp.body_bytes("ok");
            let _ = req.respond(resp);
        });

        let (client, server) = duplex(64 * 1024);
        let shared = ConnShared::new(1, None, false);
        let config = ConnectionConfig {
            conn: ConnLimits {
                max_client_idle_time: Some(Duration::from_millis(50)),
                ..ConnLimits::default()
            },
            ..ConnectionConfig::default()
        };
        let task = tokio::spawn(run_connection(
            server,
            shared.clone(),
            Arc::new(handler),
            config,
        ));

        // Say nothing; the idle timer has to fire.
        let mut client = client;
        let wire = read_to_eof(&mut client).await;
        assert!(wire.is_empty(), "{wire}");

        task.await.unwrap();
        assert_eq!(reasons.lock().unwrap().as_slice(), ["connection timed out"]);
    }
}
