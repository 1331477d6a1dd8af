//! RequestTracker: correlates replies and informs with the request that
//! produced them.
//!
//! # How a request travels (for beginners)
//!
//! ```text
//! caller                    tracker                        receive loop
//! ──────                    ───────                        ────────────
//! issue("wordread", args)
//!   → id = 17               insert pending[17]
//!                           encode "?wordread[17] ..." ──▶ writer task ──▶ board
//! await_reply(17, 1s) ...
//!                                                          "#progress[17] ..."
//!                           pending[17].informs.push  ◀── on_inform(msg)
//!                                                          "!wordread[17] ok 0x2A"
//!                           complete pending[17]      ◀── on_reply(msg)
//!   ← Completion { reply, informs }
//! ```
//!
//! Each pending request owns a one-shot completion channel.  The receive loop
//! is the only writer of replies and informs; any number of callers may issue
//! and await concurrently.  The pending table is the only shared mutable
//! state and lives behind a short-held `std::sync::Mutex`.
//!
//! # Capacity
//!
//! At most `capacity` requests may be outstanding (issued and not yet
//! retrieved).  Issuing one more evicts the request with the oldest issue
//! time, and whoever awaits it receives [`RpcError::CapacityExceeded`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use corr_core::protocol::{encode_message, Message, MessageId, ProtocolError, SequenceCounter};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Default bound on outstanding requests per connection.
pub const DEFAULT_CAPACITY: usize = 256;

/// Process-wide request id source shared by every tracker.
static NEXT_REQUEST_ID: SequenceCounter = SequenceCounter::new();

/// Errors surfaced by the request tracker and board connections.
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    /// The connection closed or failed while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    #[error("request timed out")]
    Timeout,

    /// The id was never issued, or has already been retrieved.
    #[error("unknown request id {0}")]
    UnknownRequest(MessageId),

    /// The board sent a message that contradicts the request it names.
    #[error("protocol mismatch on request {id}: {detail}")]
    ProtocolMismatch { id: MessageId, detail: String },

    /// The board answered with a non-`ok` status.
    #[error("{name} failed on board: {message}")]
    RemoteError { name: String, message: String },

    /// The request was evicted to make room for a newer one.
    #[error("request {0} evicted: too many outstanding requests")]
    CapacityExceeded(MessageId),

    /// Another caller is already awaiting this request.
    #[error("request {0} is already being awaited")]
    AwaitInProgress(MessageId),

    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(Arc::new(e))
    }
}

/// A completed request: its terminal reply plus every inform received
/// before it, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub reply: Message,
    pub informs: Vec<Message>,
}

type CompletionResult = Result<Completion, RpcError>;

#[derive(Debug)]
struct PendingRequest {
    name: String,
    issued_at: Instant,
    informs: Vec<Message>,
    completed: bool,
    completion: Option<oneshot::Sender<CompletionResult>>,
    /// The receiving end, parked here while nobody is awaiting.
    parked: Option<oneshot::Receiver<CompletionResult>>,
    inform_stream: Option<mpsc::UnboundedSender<Message>>,
}

/// Why an id is no longer in the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Evicted,
    Retrieved,
    Failed,
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: BTreeMap<MessageId, PendingRequest>,
    retired: VecDeque<(MessageId, Retired)>,
    closed: Option<RpcError>,
}

impl TrackerState {
    fn retired(&self, id: MessageId) -> Option<Retired> {
        self.retired
            .iter()
            .rev()
            .find(|(rid, _)| *rid == id)
            .map(|(_, why)| *why)
    }

    fn retire(&mut self, id: MessageId, why: Retired, limit: usize) {
        self.retired.push_back((id, why));
        while self.retired.len() > limit {
            self.retired.pop_front();
        }
    }

    /// The error an await on an id absent from the table must report.
    fn absent_error(&self, id: MessageId) -> RpcError {
        match self.retired(id) {
            Some(Retired::Evicted) => RpcError::CapacityExceeded(id),
            Some(Retired::Failed) => self.closed.clone().unwrap_or(RpcError::ConnectionLost),
            Some(Retired::Retrieved) | None => RpcError::UnknownRequest(id),
        }
    }
}

/// Issues requests over one connection and matches the board's answers.
#[derive(Debug)]
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    capacity: usize,
}

impl RequestTracker {
    /// Creates a tracker and the receiver its encoded frames are sent on.
    ///
    /// The connection's writer task drains the receiver onto the socket.
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            state: Mutex::new(TrackerState::default()),
            outbound: tx,
            capacity: capacity.max(1),
        };
        (tracker, rx)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests issued and not yet retrieved.
    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }

    /// Sends a request and returns its id without waiting for the reply.
    ///
    /// # Errors
    ///
    /// [`RpcError::Codec`] for an unencodable name, or the connection error if
    /// the connection has already failed.
    pub fn issue(&self, name: &str, arguments: Vec<String>) -> Result<MessageId, RpcError> {
        self.issue_inner(name, arguments, None)
    }

    /// Like [`issue`](Self::issue), additionally streaming every inform for
    /// the request as it arrives.  The stream ends when the reply arrives.
    ///
    /// # Errors
    ///
    /// As for [`issue`](Self::issue).
    pub fn issue_streaming(
        &self,
        name: &str,
        arguments: Vec<String>,
    ) -> Result<(MessageId, mpsc::UnboundedReceiver<Message>), RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.issue_inner(name, arguments, Some(tx))?;
        Ok((id, rx))
    }

    fn issue_inner(
        &self,
        name: &str,
        arguments: Vec<String>,
        inform_stream: Option<mpsc::UnboundedSender<Message>>,
    ) -> Result<MessageId, RpcError> {
        let mut state = self.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        // Allocated under the lock so frames leave in id order.
        let id = NEXT_REQUEST_ID.next();
        let frame = encode_message(&Message::request(name, Some(id), arguments))?;
        if state.pending.len() >= self.capacity {
            self.evict_oldest(&mut state);
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                name: name.to_string(),
                issued_at: Instant::now(),
                informs: Vec::new(),
                completed: false,
                completion: Some(tx),
                parked: Some(rx),
                inform_stream,
            },
        );

        if self.outbound.send(frame).is_err() {
            state.pending.remove(&id);
            return Err(RpcError::ConnectionLost);
        }
        debug!(id, name, "Request issued");
        Ok(id)
    }

    fn evict_oldest(&self, state: &mut TrackerState) {
        let oldest = state
            .pending
            .iter()
            .min_by_key(|(id, req)| (req.issued_at, **id))
            .map(|(id, _)| *id);
        let Some(id) = oldest else { return };
        if let Some(mut req) = state.pending.remove(&id) {
            warn!(id, name = %req.name, "Outstanding request evicted at capacity");
            if let Some(tx) = req.completion.take() {
                let _ = tx.send(Err(RpcError::CapacityExceeded(id)));
            }
        }
        state.retire(id, Retired::Evicted, self.tombstone_limit());
    }

    /// Waits for request `id` to complete.  `None` waits forever.
    ///
    /// Timing out, or dropping the returned future, leaves the request
    /// pending so it can be awaited again.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if `timeout` elapses first.
    /// - [`RpcError::UnknownRequest`] if `id` is not outstanding.
    /// - [`RpcError::CapacityExceeded`] if the request was evicted.
    /// - [`RpcError::ConnectionLost`] (or the fatal protocol error) if the
    ///   connection failed.
    pub async fn await_reply(
        &self,
        id: MessageId,
        timeout: Option<Duration>,
    ) -> Result<Completion, RpcError> {
        let rx = {
            let mut state = self.lock();
            let absent = state.absent_error(id);
            let req = state.pending.get_mut(&id).ok_or(absent)?;
            req.parked.take().ok_or(RpcError::AwaitInProgress(id))?
        };

        let mut guard = ParkGuard {
            tracker: self,
            id,
            rx: Some(rx),
        };
        let Some(outcome) = guard.wait(timeout).await else {
            return guard.repark();
        };

        let mut state = self.lock();
        if state.pending.remove(&id).is_some() {
            state.retire(id, Retired::Retrieved, self.tombstone_limit());
        }
        outcome
    }

    /// Issues a request and waits for its completion.
    ///
    /// # Errors
    ///
    /// Any error from [`issue`](Self::issue) or [`await_reply`](Self::await_reply).
    pub async fn request(
        &self,
        name: &str,
        arguments: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<Completion, RpcError> {
        let id = self.issue(name, arguments)?;
        self.await_reply(id, timeout).await
    }

    /// Issues a request and returns the reply payload, failing with
    /// [`RpcError::RemoteError`] unless the board replied `ok`.
    ///
    /// # Errors
    ///
    /// As for [`request`](Self::request), plus `RemoteError`.
    pub async fn request_with_reply_check(
        &self,
        name: &str,
        arguments: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>, RpcError> {
        let completion = self.request(name, arguments, timeout).await?;
        let reply = completion.reply;
        if reply.is_ok() {
            return Ok(reply.payload().to_vec());
        }
        let message = if reply.payload().is_empty() {
            reply
                .arguments
                .first()
                .cloned()
                .unwrap_or_else(|| "no status".to_string())
        } else {
            reply.payload().join(" ")
        };
        Err(RpcError::RemoteError {
            name: name.to_string(),
            message,
        })
    }

    /// Records an inform for its request.  Called only by the receive loop.
    ///
    /// # Errors
    ///
    /// [`RpcError::ProtocolMismatch`] if the name differs from the request's
    /// or the request already has its reply; [`RpcError::UnknownRequest`] if
    /// the id is not outstanding.  A rejected inform changes nothing.
    pub fn on_inform(&self, message: Message) -> Result<(), RpcError> {
        let id = Self::require_id(&message)?;
        let mut state = self.lock();
        if state.retired(id) == Some(Retired::Retrieved) {
            return Err(RpcError::ProtocolMismatch {
                id,
                detail: format!("inform #{} after the reply was retrieved", message.name),
            });
        }
        let req = state.pending.get_mut(&id).ok_or(RpcError::UnknownRequest(id))?;
        Self::check_name(id, req, &message)?;
        if req.completed {
            return Err(RpcError::ProtocolMismatch {
                id,
                detail: format!("inform #{} after reply", message.name),
            });
        }
        if let Some(stream) = &req.inform_stream {
            let _ = stream.send(message.clone());
        }
        req.informs.push(message);
        Ok(())
    }

    /// Completes a request with its reply.  Called only by the receive loop.
    ///
    /// # Errors
    ///
    /// [`RpcError::ProtocolMismatch`] for a name mismatch or a second reply;
    /// [`RpcError::UnknownRequest`] if the id is not outstanding.
    pub fn on_reply(&self, message: Message) -> Result<(), RpcError> {
        let id = Self::require_id(&message)?;
        let mut state = self.lock();
        if state.retired(id) == Some(Retired::Retrieved) {
            return Err(RpcError::ProtocolMismatch {
                id,
                detail: format!("second reply !{}", message.name),
            });
        }
        let req = state.pending.get_mut(&id).ok_or(RpcError::UnknownRequest(id))?;
        Self::check_name(id, req, &message)?;
        if req.completed {
            return Err(RpcError::ProtocolMismatch {
                id,
                detail: format!("second reply !{}", message.name),
            });
        }
        req.completed = true;
        req.inform_stream = None;
        debug!(
            id,
            name = %message.name,
            informs = req.informs.len(),
            elapsed_us = req.issued_at.elapsed().as_micros() as u64,
            "Request completed"
        );
        if let Some(tx) = req.completion.take() {
            let _ = tx.send(Ok(Completion {
                reply: message,
                informs: req.informs.clone(),
            }));
        }
        Ok(())
    }

    /// Informs recorded so far for an outstanding request.
    pub fn informs(&self, id: MessageId) -> Option<Vec<Message>> {
        self.lock().pending.get(&id).map(|req| req.informs.clone())
    }

    /// Fails every request still waiting for its reply with `err` and
    /// refuses new ones.  Requests whose reply already arrived stay
    /// retrievable.
    ///
    /// Called once by the receive loop when the connection ends.
    pub fn fail_all(&self, err: RpcError) {
        let mut state = self.lock();
        let unanswered: Vec<MessageId> = state
            .pending
            .iter()
            .filter(|(_, req)| !req.completed)
            .map(|(id, _)| *id)
            .collect();
        let count = unanswered.len();
        for id in unanswered {
            if let Some(mut req) = state.pending.remove(&id) {
                if let Some(tx) = req.completion.take() {
                    let _ = tx.send(Err(err.clone()));
                }
            }
            state.retire(id, Retired::Failed, self.tombstone_limit());
        }
        if count > 0 {
            warn!(count, error = %err, "Failed all outstanding requests");
        }
        state.closed = Some(err);
    }

    /// `true` once [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn require_id(message: &Message) -> Result<MessageId, RpcError> {
        message.id.ok_or_else(|| RpcError::ProtocolMismatch {
            id: 0,
            detail: format!("{} without an id routed to the tracker", message.name),
        })
    }

    fn check_name(id: MessageId, req: &PendingRequest, message: &Message) -> Result<(), RpcError> {
        if req.name == message.name {
            return Ok(());
        }
        Err(RpcError::ProtocolMismatch {
            id,
            detail: format!("expected {}, received {}", req.name, message.name),
        })
    }

    fn tombstone_limit(&self) -> usize {
        self.capacity.saturating_mul(4).max(64)
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a request's completion receiver while it is being awaited and
/// parks it back in the table if the wait ends without a verdict.
struct ParkGuard<'a> {
    tracker: &'a RequestTracker,
    id: MessageId,
    rx: Option<oneshot::Receiver<CompletionResult>>,
}

impl ParkGuard<'_> {
    /// Returns `None` on timeout, keeping the receiver.
    async fn wait(&mut self, timeout: Option<Duration>) -> Option<CompletionResult> {
        let rx = self.rx.as_mut()?;
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.ok()?,
            None => rx.await,
        };
        self.rx = None;
        // A dropped sender means the entry went away without a verdict.
        Some(received.unwrap_or(Err(RpcError::ConnectionLost)))
    }

    /// Parks the receiver after a timeout.  If the request was evicted or
    /// failed in the meantime, that verdict is returned instead of `Timeout`.
    fn repark(&mut self) -> CompletionResult {
        let Some(mut rx) = self.rx.take() else {
            return Err(RpcError::Timeout);
        };
        let mut state = self.tracker.lock();
        if let Some(req) = state.pending.get_mut(&self.id) {
            req.parked = Some(rx);
            return Err(RpcError::Timeout);
        }
        match rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(state.absent_error(self.id)),
        }
    }
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            let mut state = self.tracker.lock();
            if let Some(req) = state.pending.get_mut(&self.id) {
                req.parked = Some(rx);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
