//! TCP connection to one correlator board.
//!
//! # Tasks
//!
//! ```text
//!   callers ──issue──▶ RequestTracker ──frames──▶ writer task ──▶ TCP ──▶ board
//!      ▲                    ▲
//!      └── await_reply ─────┘◀── on_reply / on_inform ── reader task ◀── TCP
//! ```
//!
//! The reader task buffers the byte stream and decodes one line at a time,
//! exactly like any other streaming decoder: a single `read()` may return
//! half a line or several lines.  Replies and id-tagged informs go to the
//! tracker; `#log` informs are re-emitted through `tracing`.
//!
//! When the stream ends, fails, or the board sends something that contradicts
//! an outstanding request, every pending request fails and the connection is
//! unusable.  Both tasks are aborted when the [`BoardConnection`] is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use corr_core::protocol::{decode_message, Message, MessageKind, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::application::cluster::BoardId;
use crate::application::registers::RegisterBus;
use crate::application::request_tracker::{RequestTracker, RpcError, DEFAULT_CAPACITY};

/// How a connection is opened and used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// Applied to every request made through [`BoardConnection::request`].
    pub request_timeout: Duration,
    /// Bound on outstanding requests.
    pub capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// An open control connection to a board.
pub struct BoardConnection {
    id: BoardId,
    tracker: Arc<RequestTracker>,
    request_timeout: Duration,
    runtime: Handle,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BoardConnection {
    /// Connects to `address` (`host:port`) and starts the reader and writer
    /// tasks.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] if the connection is not established within
    /// `settings.connect_timeout`, or [`RpcError::Io`] if it is refused.
    pub async fn connect(
        id: BoardId,
        address: &str,
        settings: ConnectionSettings,
    ) -> Result<Self, RpcError> {
        let stream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RpcError::Timeout)??;
        stream.set_nodelay(true)?;
        info!(board = %id, address, "Connected to board");
        Ok(Self::from_stream(id, stream, settings))
    }

    /// Wraps an already-connected stream.
    pub fn from_stream(id: BoardId, stream: TcpStream, settings: ConnectionSettings) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tracker, outbound) = RequestTracker::new(settings.capacity);
        let tracker = Arc::new(tracker);

        let writer = tokio::spawn(write_frames(
            write_half,
            outbound,
            Arc::downgrade(&tracker),
            id.clone(),
        ));
        let reader = tokio::spawn(receive_loop(read_half, Arc::clone(&tracker), id.clone()));

        Self {
            id,
            tracker,
            request_timeout: settings.request_timeout,
            runtime: Handle::current(),
            reader,
            writer,
        }
    }

    pub fn id(&self) -> &BoardId {
        &self.id
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// `false` once the reader has stopped for any reason.
    pub fn is_open(&self) -> bool {
        !self.tracker.is_closed()
    }

    /// Sends a request and returns the `ok` reply's payload.
    ///
    /// # Errors
    ///
    /// [`RpcError::RemoteError`] for a non-`ok` reply, or any tracker error.
    pub async fn request(&self, name: &str, arguments: Vec<String>) -> Result<Vec<String>, RpcError> {
        self.tracker
            .request_with_reply_check(name, arguments, Some(self.request_timeout))
            .await
    }

    /// Blocking form of [`request`](Self::request) for synchronous callers.
    ///
    /// # Errors
    ///
    /// As for [`request`](Self::request).
    ///
    /// # Panics
    ///
    /// If called from inside an async context of the runtime that owns this
    /// connection; use [`request`](Self::request) there instead.
    pub fn call_blocking(&self, name: &str, arguments: Vec<String>) -> Result<Vec<String>, RpcError> {
        self.runtime.block_on(self.request(name, arguments))
    }
}

impl Drop for BoardConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.tracker.fail_all(RpcError::ConnectionLost);
    }
}

impl std::fmt::Debug for BoardConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardConnection")
            .field("id", &self.id)
            .field("outstanding", &self.tracker.outstanding())
            .finish_non_exhaustive()
    }
}

/// Register access over `?wordread` / `?wordwrite`, liveness over `?watchdog`.
#[async_trait]
impl RegisterBus for BoardConnection {
    async fn read_register(&self, register: &str) -> Result<u32, RpcError> {
        let payload = self
            .request("wordread", vec![register.to_string(), "0".to_string()])
            .await?;
        let word = payload.first().map(String::as_str).unwrap_or_default();
        parse_word(word).ok_or_else(|| {
            RpcError::Codec(ProtocolError::MalformedPayload(format!(
                "wordread {register}: expected a 32-bit word, got {word:?}"
            )))
        })
    }

    async fn write_register(&self, register: &str, value: u32) -> Result<(), RpcError> {
        self.request(
            "wordwrite",
            vec![register.to_string(), "0".to_string(), format!("{value:#x}")],
        )
        .await
        .map(|_| ())
    }

    async fn ping(&self) -> bool {
        self.request("watchdog", Vec::new()).await.is_ok()
    }
}

/// Parses `0x`-prefixed hex or plain decimal.
fn parse_word(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn write_frames(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    tracker: Weak<RequestTracker>,
    board: BoardId,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            warn!(board = %board, error = %e, "Write to board failed");
            if let Some(tracker) = tracker.upgrade() {
                tracker.fail_all(RpcError::from(e));
            }
            return;
        }
    }
    debug!(board = %board, "Outbound channel closed; writer exiting");
}

async fn receive_loop(mut read_half: OwnedReadHalf, tracker: Arc<RequestTracker>, board: BoardId) {
    let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
    let mut read_tmp = vec![0u8; 4096];

    let reason = 'read: loop {
        let n = match read_half.read(&mut read_tmp).await {
            Ok(0) => break 'read RpcError::ConnectionLost,
            Ok(n) => n,
            Err(e) => break 'read RpcError::from(e),
        };
        recv_buf.extend_from_slice(&read_tmp[..n]);

        loop {
            match decode_message(&recv_buf) {
                Ok((message, consumed)) => {
                    recv_buf.drain(..consumed);
                    if let Err(fatal) = dispatch(&tracker, &board, message) {
                        break 'read fatal;
                    }
                }
                Err(ProtocolError::InsufficientData { .. }) => break,
                Err(e) => break 'read RpcError::Codec(e),
            }
        }
    };

    match &reason {
        RpcError::ConnectionLost => info!(board = %board, "Board closed the connection"),
        other => error!(board = %board, error = %other, "Board connection failed"),
    }
    tracker.fail_all(reason);
}

/// Routes one decoded message.  Only a protocol mismatch is fatal.
fn dispatch(tracker: &RequestTracker, board: &BoardId, message: Message) -> Result<(), RpcError> {
    let outcome = match (message.kind, message.id) {
        (MessageKind::Reply, Some(_)) => tracker.on_reply(message),
        (MessageKind::Inform, Some(_)) => tracker.on_inform(message),
        (MessageKind::Inform, None) if message.name == "log" => {
            log_inform(board, &message);
            Ok(())
        }
        (MessageKind::Inform, None) => {
            debug!(board = %board, name = %message.name, args = ?message.arguments, "Unsolicited inform");
            Ok(())
        }
        (MessageKind::Reply, None) => {
            warn!(board = %board, name = %message.name, "Reply without a request id ignored");
            Ok(())
        }
        (MessageKind::Request, _) => {
            warn!(board = %board, name = %message.name, "Board sent a request; ignored");
            Ok(())
        }
    };
    match outcome {
        Err(e @ RpcError::ProtocolMismatch { .. }) => Err(e),
        Err(e) => {
            // Late replies for timed-out or evicted requests land here.
            debug!(board = %board, error = %e, "Discarded message");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// `#log <level> <timestamp> <source> <message...>`
fn log_inform(board: &BoardId, message: &Message) {
    let args = &message.arguments;
    let level = args.first().map(String::as_str).unwrap_or("info");
    let source = args.get(2).map(String::as_str).unwrap_or("");
    let text = args.get(3..).map(|rest| rest.join(" ")).unwrap_or_default();
    match level {
        "fatal" | "error" => error!(target: "board", board = %board, source, "{text}"),
        "warn" => warn!(target: "board", board = %board, source, "{text}"),
        "debug" => debug!(target: "board", board = %board, source, "{text}"),
        "trace" | "all" => trace!(target: "board", board = %board, source, "{text}"),
        _ => info!(target: "board", board = %board, source, "{text}"),
    }
}
