//! One request+response exchange and its state machine.
//!
//! A [`Request`] is handed to the application handler once its head is parsed.
//! The handler reads the payload through [`Request::take_payload`], then
//! settles the exchange with exactly one of [`respond`](Request::respond),
//! [`respond_writer`](Request::respond_writer) or
//! [`respond_tunnel`](Request::respond_tunnel). Dropping the handle without
//! responding synthesizes an error response so the connection's response
//! ordering never stalls.

use crate::{
    errors::Error,
    http::{
        parser::{BodyKind, ParsedHead},
        response::Response,
        types::{HeaderMap, Version},
    },
    server::{payload::PayloadReader, transport::Tunnel},
    StatusCode,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::sync::{oneshot, Notify};

/// Lifecycle of one exchange. Variants are ordered: later phases compare
/// greater, which the connection uses for "at least submitted" checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    /// Head still being parsed.
    New,
    /// Head parsed, handler callback dispatched.
    Queued,
    /// Handler is reading the request payload.
    PayloadIn,
    /// Payload fully read, no response submitted yet.
    Processing,
    /// Response submitted; unread request payload is being skipped.
    SubmittedResponse,
    /// Response submitted and request payload fully read or discarded.
    ReadyToRespond,
    /// Response head written to the wire.
    SentResponse,
    /// Response payload being written.
    PayloadOut,
    /// Exchange complete.
    Finished,
    /// Exchange abandoned: connection lost or request failed.
    Aborted,
}

impl RequestState {
    #[inline(always)]
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Finished | RequestState::Aborted)
    }

    /// Transition legality table.
    pub(crate) fn may_become(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (_, Aborted) => !self.is_terminal(),
            (New, Queued) => true,
            (Queued, PayloadIn | Processing) => true,
            (PayloadIn, Processing | SubmittedResponse) => true,
            (Processing, SubmittedResponse) => true,
            (SubmittedResponse, ReadyToRespond) => true,
            (ReadyToRespond, SentResponse) => true,
            (SentResponse, PayloadOut | Finished) => true,
            (PayloadOut, Finished) => true,
            _ => false,
        }
    }
}

/// State shared between the request handle, the handler task and both
/// connection loops. This is the exchange's single ownership anchor: the
/// `Arc` count plays the role of an explicit refcount, and the destroy
/// callback fires exactly once when a terminal state is reached.
pub(crate) struct ReqShared {
    pub(crate) id: u64,
    pub(crate) conn_id: u64,
    pub(crate) label: String,
    state: Mutex<RequestState>,
    pub(crate) changed: Notify,
    /// Request payload fully consumed (or there was none).
    pub(crate) body_complete: AtomicBool,
    pub(crate) sent_100_continue: AtomicBool,
    pub(crate) failed: AtomicBool,
    /// Status for a synthesized response when the request failed before the
    /// handler settled it (e.g. payload overflow wants a 413, not a 500).
    fail_status: Mutex<Option<StatusCode>>,
    destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Live entries in the owning connection's queue; decremented once when
    /// this request reaches a terminal state.
    queue_count: Arc<AtomicUsize>,
}

impl ReqShared {
    pub(crate) fn new(
        id: u64,
        conn_id: u64,
        label: String,
        queue_count: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        queue_count.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            id,
            conn_id,
            label,
            state: Mutex::new(RequestState::New),
            changed: Notify::new(),
            body_complete: AtomicBool::new(false),
            sent_100_continue: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            fail_status: Mutex::new(None),
            destroy: Mutex::new(None),
            queue_count,
        })
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock().unwrap()
    }

    /// Performs one transition. Illegal transitions are a bug in the caller;
    /// they are asserted in debug builds and ignored in release builds so a
    /// racing abort can never corrupt the machine.
    pub(crate) fn advance(&self, next: RequestState) {
        let fired = {
            let mut state = self.state.lock().unwrap();
            if state.is_terminal() {
                return;
            }
            debug_assert!(
                state.may_become(next),
                "{}: illegal transition {:?} -> {next:?}",
                self.label,
                *state,
            );
            if !state.may_become(next) {
                return;
            }
            *state = next;
            next.is_terminal()
        };

        self.changed.notify_waiters();
        if fired {
            self.on_terminal();
        }
    }

    fn on_terminal(&self) {
        self.queue_count.fetch_sub(1, Ordering::SeqCst);
        if let Some(callback) = self.destroy.lock().unwrap().take() {
            callback();
        }
    }

    pub(crate) fn abort(&self) {
        self.advance(RequestState::Aborted);
    }

    /// Handler began reading the payload.
    pub(crate) fn begin_payload(&self) {
        let advanced = {
            let mut state = self.state.lock().unwrap();
            if *state == RequestState::Queued {
                *state = RequestState::PayloadIn;
                true
            } else {
                false
            }
        };
        if advanced {
            self.changed.notify_waiters();
        }
    }

    /// Payload stream reached EOF before any response was submitted.
    pub(crate) fn payload_eof(&self) {
        self.body_complete.store(true, Ordering::SeqCst);
        let advanced = {
            let mut state = self.state.lock().unwrap();
            match *state {
                RequestState::PayloadIn => {
                    *state = RequestState::Processing;
                    true
                }
                RequestState::SubmittedResponse => {
                    *state = RequestState::ReadyToRespond;
                    true
                }
                _ => false,
            }
        };
        if advanced {
            self.changed.notify_waiters();
        }
    }

    /// Handler submitted a response. Steps through the table from wherever
    /// the exchange currently is (observers never see a state skipped) and
    /// reaches `ReadyToRespond` at once when the payload is already drained.
    pub(crate) fn mark_submitted(&self) -> Result<(), Error> {
        match self.state() {
            RequestState::Aborted => return Err(Error::ConnectionClosed),
            RequestState::Queued => {
                self.advance(RequestState::Processing);
                self.advance(RequestState::SubmittedResponse);
            }
            RequestState::PayloadIn | RequestState::Processing => {
                self.advance(RequestState::SubmittedResponse);
            }
            _ => return Err(Error::HandlerSubmit("response already submitted")),
        }
        if self.body_complete.load(Ordering::SeqCst) {
            self.advance(RequestState::ReadyToRespond);
        }
        Ok(())
    }

    /// Waits until the state is at least `min`, or terminal.
    pub(crate) async fn wait_min(&self, min: RequestState) -> RequestState {
        loop {
            let notified = self.changed.notified();
            let state = self.state();
            if state >= min || state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    /// Waits until the exchange is finished or aborted.
    pub(crate) async fn wait_terminal(&self) -> RequestState {
        self.wait_min(RequestState::Finished).await
    }

    /// Marks the request failed with the status a synthesized response
    /// should carry if the handler never answers.
    pub(crate) fn mark_failed(&self, status: StatusCode) {
        self.failed.store(true, Ordering::SeqCst);
        let mut fail_status = self.fail_status.lock().unwrap();
        if fail_status.is_none() {
            *fail_status = Some(status);
        }
    }

    pub(crate) fn take_fail_status(&self) -> Option<StatusCode> {
        self.fail_status.lock().unwrap().take()
    }

    pub(crate) fn set_destroy_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        if self.state().is_terminal() {
            callback();
            return;
        }
        *self.destroy.lock().unwrap() = Some(callback);
    }
}

/// Monotonic request id source, one per connection.
#[derive(Debug, Default)]
pub(crate) struct RequestIds(AtomicU64);

impl RequestIds {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub(crate) type TunnelCallback = Box<dyn FnOnce(Tunnel) + Send>;

/// What the handler hands back to the connection.
pub(crate) struct Submission {
    pub(crate) response: Response,
    pub(crate) tunnel: Option<TunnelCallback>,
}

/// One HTTP request, owned by the application handler for the duration of the
/// callback.
pub struct Request {
    head: ParsedHead,
    shared: Arc<ReqShared>,
    payload: Option<PayloadReader>,
    submit: Option<oneshot::Sender<Submission>>,
    fallback_status: StatusCode,
}

impl Request {
    pub(crate) fn new(
        head: ParsedHead,
        shared: Arc<ReqShared>,
        payload: Option<PayloadReader>,
        submit: oneshot::Sender<Submission>,
        fallback_status: StatusCode,
    ) -> Self {
        Self {
            head,
            shared,
            payload,
            submit: Some(submit),
            fallback_status,
        }
    }

    /// Per-connection monotonic request id.
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Id of the connection this request arrived on.
    #[inline(always)]
    pub fn connection_id(&self) -> u64 {
        self.shared.conn_id
    }

    /// Current lifecycle state of this exchange. Reaches
    /// [`Aborted`](RequestState::Aborted) when the connection went away
    /// before the exchange could finish.
    #[inline(always)]
    pub fn state(&self) -> RequestState {
        self.shared.state()
    }

    #[inline(always)]
    pub fn method(&self) -> &str {
        &self.head.method
    }

    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.head.target
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.head.version
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// First value of `name`, case-insensitive.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.head.headers.get(name)
    }

    /// Whether the request announced a payload.
    #[inline(always)]
    pub fn has_payload(&self) -> bool {
        self.head.body != BodyKind::None
    }

    /// Whether the client asked for a `100 Continue` before sending payload.
    #[inline(always)]
    pub fn expects_continue(&self) -> bool {
        self.head.expect_continue
    }

    /// Takes the payload stream. `None` when the request has no payload or it
    /// was already taken.
    pub fn take_payload(&mut self) -> Option<PayloadReader> {
        self.payload.take()
    }

    /// Registers a callback fired exactly once when this exchange reaches
    /// `Finished` or `Aborted` (fired immediately if it already has).
    pub fn on_destroy(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.set_destroy_callback(Box::new(callback));
    }

    /// Submits the final response. Any unread request payload is skipped on
    /// the input before the response goes out.
    pub fn respond(mut self, response: Response) -> Result<(), Error> {
        response.check_submittable()?;
        self.send(Submission {
            response,
            tunnel: None,
        })
    }

    /// Submits a response whose body the handler writes incrementally.
    ///
    /// The returned [`BodyWriter`](crate::BodyWriter) back-pressures: writes
    /// suspend while the connection catches up. Dropping the writer ends the
    /// body.
    pub fn respond_writer(mut self, mut response: Response) -> Result<crate::BodyWriter, Error> {
        response.check_submittable()?;
        let writer = response.attach_writer()?;
        self.send(Submission {
            response,
            tunnel: None,
        })?;
        Ok(writer)
    }

    /// Submits a 2xx response and turns the connection into a raw byte tunnel
    /// once the response head is flushed. The callback receives the detached
    /// transport plus any bytes the client already sent past the head.
    pub fn respond_tunnel(
        mut self,
        response: Response,
        callback: impl FnOnce(Tunnel) + Send + 'static,
    ) -> Result<(), Error> {
        response.check_submittable()?;
        if !response.status().is_success() {
            return Err(Error::HandlerSubmit("tunnel requires a 2xx response"));
        }
        if response.has_body() {
            return Err(Error::HandlerSubmit("tunnel response cannot carry a body"));
        }
        self.send(Submission {
            response,
            tunnel: Some(Box::new(callback)),
        })
    }

    fn send(&mut self, submission: Submission) -> Result<(), Error> {
        let tx = self
            .submit
            .take()
            .ok_or(Error::HandlerSubmit("response already submitted"))?;

        self.shared.mark_submitted()?;
        if tx.send(submission).is_err() {
            self.shared.abort();
            return Err(Error::ConnectionClosed);
        }

        tracing::trace!(request = %self.shared.label, "response submitted");
        Ok(())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        let Some(tx) = self.submit.take() else {
            return;
        };

        // A handler that returns without settling the exchange must not stall
        // the pipeline behind it.
        tracing::warn!(
            request = %self.shared.label,
            "handler dropped request without a response"
        );
        self.shared.failed.store(true, Ordering::SeqCst);
        let status = self
            .shared
            .take_fail_status()
            .unwrap_or(self.fallback_status);

        if self.shared.mark_submitted().is_ok() {
            let mut response = Response::new(status);
            response.close();
            let _ = tx.send(Submission {
                response,
                tunnel: None,
            });
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("method", &self.head.method)
            .field("target", &self.head.target)
            .field("state", &self.shared.state())
            .field("failed", &self.shared.failed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ParsedHead {
    /// Compact identification used in log events, e.g. `[Req3: GET /path]`.
    pub(crate) fn label(&self, id: u64) -> String {
        format!("[Req{id}: {} {}]", self.method, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<ReqShared> {
        ReqShared::new(1, 7, "[Req1: GET /]".into(), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn transition_table() {
        use RequestState::*;

        #[rustfmt::skip]
        let legal = [
            (New, Queued),
            (Queued, PayloadIn), (Queued, Processing),
            (PayloadIn, Processing), (PayloadIn, SubmittedResponse),
            (Processing, SubmittedResponse),
            (SubmittedResponse, ReadyToRespond),
            (ReadyToRespond, SentResponse),
            (SentResponse, PayloadOut), (SentResponse, Finished),
            (PayloadOut, Finished),
            (New, Aborted), (Queued, Aborted), (PayloadIn, Aborted),
            (Processing, Aborted), (SubmittedResponse, Aborted),
            (ReadyToRespond, Aborted), (SentResponse, Aborted),
            (PayloadOut, Aborted),
        ];
        for (from, to) in legal {
            assert!(from.may_become(to), "{from:?} -> {to:?} should be legal");
        }

        #[rustfmt::skip]
        let illegal = [
            (New, Processing), (New, SubmittedResponse), (New, Finished),
            (Queued, SubmittedResponse), (Queued, SentResponse),
            (Processing, ReadyToRespond), (Processing, Finished),
            (SubmittedResponse, SentResponse),
            (SentResponse, ReadyToRespond),
            (Finished, Aborted), (Aborted, Finished), (Finished, Queued),
        ];
        for (from, to) in illegal {
            assert!(!from.may_become(to), "{from:?} -> {to:?} should be illegal");
        }
    }

    #[test]
    fn state_ordering_matches_lifecycle() {
        use RequestState::*;
        assert!(Queued < SubmittedResponse);
        assert!(SubmittedResponse < ReadyToRespond);
        assert!(ReadyToRespond < SentResponse);
        assert!(PayloadOut < Finished);
    }

    #[test]
    fn queue_count_tracks_terminal_states() {
        let count = Arc::new(AtomicUsize::new(0));
        let a = ReqShared::new(1, 1, "[Req1: GET /]".into(), count.clone());
        let b = ReqShared::new(2, 1, "[Req2: GET /]".into(), count.clone());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        a.advance(RequestState::Queued);
        a.abort();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A second abort must not double-count.
        a.abort();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        b.abort();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn submit_paths() {
        // Without payload: Queued -> ReadyToRespond directly once the body is
        // known complete.
        let s = shared();
        s.advance(RequestState::Queued);
        s.body_complete.store(true, Ordering::SeqCst);
        s.mark_submitted().unwrap();
        assert_eq!(s.state(), RequestState::ReadyToRespond);
        assert_eq!(
            s.mark_submitted(),
            Err(Error::HandlerSubmit("response already submitted"))
        );

        // With unread payload: parks in SubmittedResponse until the discard
        // finishes.
        let s = shared();
        s.advance(RequestState::Queued);
        s.mark_submitted().unwrap();
        assert_eq!(s.state(), RequestState::SubmittedResponse);
        s.payload_eof();
        assert_eq!(s.state(), RequestState::ReadyToRespond);

        // EOF during PayloadIn moves to Processing.
        let s = shared();
        s.advance(RequestState::Queued);
        s.begin_payload();
        assert_eq!(s.state(), RequestState::PayloadIn);
        s.payload_eof();
        assert_eq!(s.state(), RequestState::Processing);
        s.mark_submitted().unwrap();
        assert_eq!(s.state(), RequestState::ReadyToRespond);
    }

    #[test]
    fn destroy_callback_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let s = shared();
        let fired2 = fired.clone();
        s.set_destroy_callback(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        s.advance(RequestState::Queued);
        s.abort();
        s.abort();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Registering after termination fires immediately.
        let fired3 = fired.clone();
        s.set_destroy_callback(Box::new(move || {
            fired3.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_min_wakes_on_transition() {
        let s = shared();
        s.advance(RequestState::Queued);

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_min(RequestState::ReadyToRespond).await })
        };

        s.body_complete.store(true, Ordering::SeqCst);
        s.mark_submitted().unwrap();
        assert_eq!(waiter.await.unwrap(), RequestState::ReadyToRespond);
    }

    #[test]
    fn request_ids_are_monotonic() {
        let ids = RequestIds::default();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }
}
