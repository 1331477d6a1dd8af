//! Line codec for the board control protocol.
//!
//! Wire format (one message per line):
//! ```text
//! <sigil><name>[<id>] <arg> <arg> ...\n
//! ```
//! `sigil` is `?`, `!` or `#`.  The `[<id>]` suffix is optional.  Arguments
//! are separated by one or more spaces or tabs and use backslash escapes for
//! characters that would otherwise break the framing:
//!
//! | Escape | Meaning              |
//! |--------|----------------------|
//! | `\\`   | backslash            |
//! | `\_`   | space                |
//! | `\0`   | NUL                  |
//! | `\n`   | newline              |
//! | `\r`   | carriage return      |
//! | `\e`   | escape (0x1B)        |
//! | `\t`   | tab                  |
//! | `\@`   | the empty argument   |

use crate::protocol::messages::{Message, MessageId, MessageKind};
use thiserror::Error;

/// Longest line the decoder accepts before giving up on a stream.
pub const MAX_LINE_LENGTH: usize = 1 << 20;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// No complete line is buffered yet.
    #[error("insufficient data: no line terminator in {available} buffered bytes")]
    InsufficientData { available: usize },

    /// The first byte of the line is not `?`, `!` or `#`.
    #[error("unknown message sigil: 0x{0:02X}")]
    UnknownSigil(u8),

    /// The message name is empty or contains characters outside `[A-Za-z0-9-]`.
    #[error("invalid message name: {0:?}")]
    InvalidName(String),

    /// The bracketed message id is not a positive decimal integer.
    #[error("invalid message id: {0:?}")]
    InvalidMessageId(String),

    /// An argument contains an unknown or truncated backslash escape.
    #[error("invalid escape sequence: \\{0}")]
    InvalidEscape(char),

    /// The line is not valid UTF-8 or is otherwise unparseable.
    #[error("malformed line: {0}")]
    MalformedPayload(String),

    /// A line exceeded [`MAX_LINE_LENGTH`] without a terminator.
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] into one newline-terminated line.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidName`] or [`ProtocolError::InvalidMessageId`]
/// if the message could not be decoded again by a peer.
///
/// # Examples
///
/// ```rust
/// use corr_core::protocol::{decode_message, encode_message, Message};
///
/// let msg = Message::request("wordread", Some(7), vec!["sync_status".into(), "0".into()]);
/// let bytes = encode_message(&msg).unwrap();
/// assert_eq!(bytes, b"?wordread[7] sync_status 0\n");
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    validate_name(&msg.name)?;
    if msg.id == Some(0) {
        return Err(ProtocolError::InvalidMessageId("0".to_string()));
    }

    let mut buf = Vec::with_capacity(16 + msg.name.len() + msg.arguments.len() * 12);
    buf.push(msg.kind.sigil());
    buf.extend_from_slice(msg.name.as_bytes());
    if let Some(id) = msg.id {
        buf.push(b'[');
        buf.extend_from_slice(id.to_string().as_bytes());
        buf.push(b']');
    }
    for arg in &msg.arguments {
        buf.push(b' ');
        escape_into(&mut buf, arg);
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Decodes one [`Message`] from the beginning of `bytes`.
///
/// Returns the decoded message and the number of bytes consumed (including
/// the terminator and any blank lines skipped before the message), so the
/// caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when no complete line is
/// buffered; streaming readers should wait for more bytes in that case.
/// Any other variant means the line is corrupt.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let mut offset = 0;
    loop {
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            if rest.len() > MAX_LINE_LENGTH {
                return Err(ProtocolError::LineTooLong {
                    limit: MAX_LINE_LENGTH,
                });
            }
            return Err(ProtocolError::InsufficientData {
                available: bytes.len(),
            });
        };

        let mut line = &rest[..newline];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        offset += newline + 1;

        if line.iter().all(|b| *b == b' ' || *b == b'\t') {
            continue;
        }
        let msg = decode_line(line)?;
        return Ok((msg, offset));
    }
}

// ── Line decoding ─────────────────────────────────────────────────────────────

fn decode_line(line: &[u8]) -> Result<Message, ProtocolError> {
    let text =
        std::str::from_utf8(line).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    let mut tokens = text.split([' ', '\t']).filter(|t| !t.is_empty());
    let head = tokens
        .next()
        .ok_or_else(|| ProtocolError::MalformedPayload("empty line".to_string()))?;

    let sigil = head.as_bytes()[0];
    let kind = MessageKind::try_from(sigil).map_err(|_| ProtocolError::UnknownSigil(sigil))?;

    let (name, id) = split_name_and_id(&head[1..])?;
    validate_name(name)?;

    let arguments = tokens.map(unescape).collect::<Result<Vec<_>, _>>()?;

    Ok(Message {
        kind,
        name: name.to_string(),
        id,
        arguments,
    })
}

fn split_name_and_id(head: &str) -> Result<(&str, Option<MessageId>), ProtocolError> {
    let Some(open) = head.find('[') else {
        return Ok((head, None));
    };
    let digits = head[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| ProtocolError::InvalidMessageId(head[open..].to_string()))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidMessageId(digits.to_string()));
    }
    let id: MessageId = digits
        .parse()
        .map_err(|_| ProtocolError::InvalidMessageId(digits.to_string()))?;
    if id == 0 {
        return Err(ProtocolError::InvalidMessageId(digits.to_string()));
    }
    Ok((&head[..open], Some(id)))
}

fn validate_name(name: &str) -> Result<(), ProtocolError> {
    let mut bytes = name.bytes();
    let valid = match bytes.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            bytes.all(|b| b.is_ascii_alphanumeric() || b == b'-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName(name.to_string()))
    }
}

// ── Escaping ──────────────────────────────────────────────────────────────────

fn escape_into(buf: &mut Vec<u8>, arg: &str) {
    if arg.is_empty() {
        buf.extend_from_slice(b"\\@");
        return;
    }
    for &b in arg.as_bytes() {
        match b {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b' ' => buf.extend_from_slice(b"\\_"),
            0 => buf.extend_from_slice(b"\\0"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            0x1B => buf.extend_from_slice(b"\\e"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            other => buf.push(other),
        }
    }
}

fn unescape(token: &str) -> Result<String, ProtocolError> {
    if token == "\\@" {
        return Ok(String::new());
    }
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('_') => out.push(' '),
            Some('0') => out.push('\0'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('e') => out.push('\x1b'),
            Some('t') => out.push('\t'),
            Some(other) => return Err(ProtocolError::InvalidEscape(other)),
            None => return Err(ProtocolError::InvalidEscape('\\')),
        }
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ReplyStatus;

    fn round_trip(msg: &Message) -> Message {
        let bytes = encode_message(msg).expect("encode must succeed");
        let (decoded, consumed) = decode_message(&bytes).expect("decode must succeed");
        assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
        decoded
    }

    // ── Encoding ──────────────────────────────────────────────────────────────

    #[test]
    fn test_encode_request_without_id() {
        let msg = Message::request("watchdog", None, vec![]);
        assert_eq!(encode_message(&msg).unwrap(), b"?watchdog\n");
    }

    #[test]
    fn test_encode_reply_with_id_and_status() {
        let msg = Message::reply("wordwrite", Some(42), ReplyStatus::Ok, vec![]);
        assert_eq!(encode_message(&msg).unwrap(), b"!wordwrite[42] ok\n");
    }

    #[test]
    fn test_encode_escapes_whitespace_and_backslash() {
        let msg = Message::inform("log", None, vec!["a b\\c\td".into()]);
        assert_eq!(encode_message(&msg).unwrap(), b"#log a\\_b\\\\c\\td\n");
    }

    #[test]
    fn test_encode_empty_argument_uses_at_escape() {
        let msg = Message::request("echo", Some(1), vec![String::new(), "x".into()]);
        assert_eq!(encode_message(&msg).unwrap(), b"?echo[1] \\@ x\n");
    }

    #[test]
    fn test_encode_rejects_invalid_name() {
        let msg = Message::request("9lives", None, vec![]);
        assert!(matches!(
            encode_message(&msg),
            Err(ProtocolError::InvalidName(_))
        ));
    }

    #[test]
    fn test_encode_rejects_zero_id() {
        let msg = Message::request("watchdog", Some(0), vec![]);
        assert!(matches!(
            encode_message(&msg),
            Err(ProtocolError::InvalidMessageId(_))
        ));
    }

    // ── Decoding ──────────────────────────────────────────────────────────────

    #[test]
    fn test_decode_reply_with_payload() {
        let (msg, consumed) = decode_message(b"!wordread[9] ok 0xDEADBEEF\n").unwrap();
        assert_eq!(consumed, 27);
        assert_eq!(msg.kind, MessageKind::Reply);
        assert_eq!(msg.name, "wordread");
        assert_eq!(msg.id, Some(9));
        assert_eq!(msg.payload(), ["0xDEADBEEF".to_string()]);
    }

    #[test]
    fn test_decode_tolerates_crlf_and_repeated_separators() {
        let (msg, _) = decode_message(b"#log  info\t\tboot\r\n").unwrap();
        assert_eq!(msg.arguments, vec!["info".to_string(), "boot".to_string()]);
    }

    #[test]
    fn test_decode_skips_blank_lines() {
        let bytes = b"\n  \r\n?watchdog\n";
        let (msg, consumed) = decode_message(bytes).unwrap();
        assert_eq!(msg.name, "watchdog");
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_decode_without_newline_is_insufficient_data() {
        let result = decode_message(b"!wordread[1] ok");
        assert!(matches!(result, Err(ProtocolError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_unknown_sigil() {
        let result = decode_message(b"*boom\n");
        assert_eq!(result, Err(ProtocolError::UnknownSigil(b'*')));
    }

    #[test]
    fn test_decode_rejects_bad_ids() {
        for line in [&b"?a[]\n"[..], b"?a[x]\n", b"?a[0]\n", b"?a[3\n"] {
            assert!(
                matches!(decode_message(line), Err(ProtocolError::InvalidMessageId(_))),
                "line {:?} must be rejected",
                String::from_utf8_lossy(line)
            );
        }
    }

    #[test]
    fn test_decode_rejects_unknown_escape() {
        let result = decode_message(b"#log bad\\q\n");
        assert_eq!(result, Err(ProtocolError::InvalidEscape('q')));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let result = decode_message(b"#log \xFF\n");
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_decode_unterminated_line_over_limit_is_fatal() {
        let bytes = vec![b'a'; MAX_LINE_LENGTH + 1];
        assert_eq!(
            decode_message(&bytes),
            Err(ProtocolError::LineTooLong {
                limit: MAX_LINE_LENGTH
            })
        );
    }

    // ── Round trips ───────────────────────────────────────────────────────────

    #[test]
    fn test_round_trip_control_characters() {
        let msg = Message::inform(
            "log",
            Some(5),
            vec!["\0\r\n\x1b \t\\".into(), String::new(), "tail".into()],
        );
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_two_messages_in_one_buffer_decode_independently() {
        let first = Message::inform("progress", Some(3), vec!["50".into()]);
        let second = Message::reply("upload", Some(3), ReplyStatus::Fail, vec!["disk full".into()]);
        let mut buf = encode_message(&first).unwrap();
        buf.extend_from_slice(&encode_message(&second).unwrap());

        let (decoded1, n1) = decode_message(&buf).unwrap();
        let (decoded2, n2) = decode_message(&buf[n1..]).unwrap();

        assert_eq!(decoded1, first);
        assert_eq!(decoded2, second);
        assert_eq!(n1 + n2, buf.len());
    }
}
