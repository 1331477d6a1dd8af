//! Board control protocol message types.
//!
//! Every board speaks a line-oriented request/reply/inform protocol over a
//! persistent TCP connection:
//!
//! ```text
//! ?wordread[7] sync_status 0        request, message id 7
//! #progress[7] 50%                  inform belonging to request 7
//! !wordread[7] ok 0x10000003        terminal reply for request 7
//! #log info 1700000000.123 fw boot  unsolicited inform (no id)
//! ```
//!
//! A request produces exactly one reply and zero or more informs carrying the
//! same name and message id.  Informs without an id are unsolicited board
//! notifications.

use serde::{Deserialize, Serialize};

/// Numeric message id used to correlate replies and informs with a request.
pub type MessageId = u64;

// ── Message kinds ─────────────────────────────────────────────────────────────

/// The three message kinds, identified on the wire by their leading sigil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// `?name` – sent by the controller.
    Request,
    /// `!name` – terminal answer to a request.
    Reply,
    /// `#name` – intermediate or unsolicited notification.
    Inform,
}

impl MessageKind {
    /// The sigil byte that prefixes this kind on the wire.
    pub const fn sigil(self) -> u8 {
        match self {
            MessageKind::Request => b'?',
            MessageKind::Reply => b'!',
            MessageKind::Inform => b'#',
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            b'?' => Ok(MessageKind::Request),
            b'!' => Ok(MessageKind::Reply),
            b'#' => Ok(MessageKind::Inform),
            _ => Err(()),
        }
    }
}

// ── Reply status ──────────────────────────────────────────────────────────────

/// Status word carried as the first argument of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    Fail,
    Invalid,
}

impl ReplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Fail => "fail",
            ReplyStatus::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(ReplyStatus::Ok),
            "fail" => Some(ReplyStatus::Fail),
            "invalid" => Some(ReplyStatus::Invalid),
            _ => None,
        }
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub name: String,
    /// Correlation id; `None` for unsolicited informs and id-less requests.
    pub id: Option<MessageId>,
    /// Unescaped arguments.  An empty string is a legal argument.
    pub arguments: Vec<String>,
}

impl Message {
    /// Builds a request message.
    pub fn request(name: impl Into<String>, id: Option<MessageId>, arguments: Vec<String>) -> Self {
        Self {
            kind: MessageKind::Request,
            name: name.into(),
            id,
            arguments,
        }
    }

    /// Builds a reply whose first argument is `status`.
    pub fn reply(
        name: impl Into<String>,
        id: Option<MessageId>,
        status: ReplyStatus,
        payload: Vec<String>,
    ) -> Self {
        let mut arguments = Vec::with_capacity(payload.len() + 1);
        arguments.push(status.as_str().to_string());
        arguments.extend(payload);
        Self {
            kind: MessageKind::Reply,
            name: name.into(),
            id,
            arguments,
        }
    }

    /// Builds an inform message.
    pub fn inform(name: impl Into<String>, id: Option<MessageId>, arguments: Vec<String>) -> Self {
        Self {
            kind: MessageKind::Inform,
            name: name.into(),
            id,
            arguments,
        }
    }

    /// The reply status, or `None` for non-replies and replies with an
    /// unrecognised status word.
    pub fn status(&self) -> Option<ReplyStatus> {
        if self.kind != MessageKind::Reply {
            return None;
        }
        self.arguments.first().and_then(|s| ReplyStatus::parse(s))
    }

    /// Returns `true` for a reply whose status is `ok`.
    pub fn is_ok(&self) -> bool {
        self.status() == Some(ReplyStatus::Ok)
    }

    /// Reply arguments after the status word.  For requests and informs this
    /// is the full argument list.
    pub fn payload(&self) -> &[String] {
        match self.kind {
            MessageKind::Reply if !self.arguments.is_empty() => &self.arguments[1..],
            _ => &self.arguments,
        }
    }
}
