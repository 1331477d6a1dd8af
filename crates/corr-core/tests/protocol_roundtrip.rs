//! Integration tests for the corr-core line codec.
//!
//! These tests drive the public API the way a connection's receive loop
//! does: bytes arrive in arbitrary chunks, several frames share a buffer, and
//! a partial line must be kept until its terminator arrives.

use corr_core::{
    decode_message, encode_message,
    protocol::{sequence::SequenceCounter, MessageKind},
    Message, ProtocolError, ReplyStatus,
};

/// Feeds `bytes` into a reader buffer `chunk` bytes at a time and returns
/// every message decoded, mirroring the accumulate-and-drain read loop.
fn decode_in_chunks(bytes: &[u8], chunk: usize) -> Vec<Message> {
    let mut buffer = Vec::new();
    let mut decoded = Vec::new();
    for piece in bytes.chunks(chunk) {
        buffer.extend_from_slice(piece);
        loop {
            match decode_message(&buffer) {
                Ok((msg, consumed)) => {
                    decoded.push(msg);
                    buffer.drain(..consumed);
                }
                Err(ProtocolError::InsufficientData { .. }) => break,
                Err(e) => panic!("unexpected decode error: {e}"),
            }
        }
    }
    assert!(buffer.is_empty(), "no bytes may be left over");
    decoded
}

fn transcript() -> Vec<Message> {
    let ids = SequenceCounter::new();
    let read = ids.next();
    let write = ids.next();
    vec![
        Message::inform("version-connect", None, vec!["katcp-protocol".into(), "5.0-MI".into()]),
        Message::inform("log", None, vec!["info".into(), "1700000000.000".into(), "sync".into(), "armed and waiting".into()]),
        Message::inform("progress", Some(read), vec!["step 1/2".into()]),
        Message::reply("wordread", Some(read), ReplyStatus::Ok, vec!["0x10000001".into()]),
        Message::reply("wordwrite", Some(write), ReplyStatus::Fail, vec!["register vacc_ctrl is read-only".into()]),
    ]
}

fn encode_all(messages: &[Message]) -> Vec<u8> {
    messages
        .iter()
        .flat_map(|m| encode_message(m).expect("encode must succeed"))
        .collect()
}

// ── Streaming ─────────────────────────────────────────────────────────────────

#[test]
fn test_transcript_decodes_identically_for_every_chunk_size() {
    // Arrange
    let messages = transcript();
    let bytes = encode_all(&messages);

    // Act / Assert
    for chunk in [1, 2, 3, 7, 16, 64, bytes.len()] {
        assert_eq!(decode_in_chunks(&bytes, chunk), messages, "chunk size {chunk}");
    }
}

#[test]
fn test_partial_line_is_insufficient_data_until_terminated() {
    let full = b"!wordread[3] ok 0x2A\n";
    for cut in 0..full.len() {
        assert!(
            matches!(
                decode_message(&full[..cut]),
                Err(ProtocolError::InsufficientData { .. })
            ),
            "prefix of length {cut} must wait for more data"
        );
    }
    let (msg, consumed) = decode_message(full).unwrap();
    assert_eq!(consumed, full.len());
    assert_eq!(msg.payload(), ["0x2A".to_string()]);
}

// ── Message semantics ─────────────────────────────────────────────────────────

#[test]
fn test_failed_reply_carries_board_message_as_payload() {
    let bytes = b"!wordwrite[8] fail register\\_vacc_ctrl\\_is\\_read-only\n";
    let (msg, _) = decode_message(bytes).unwrap();

    assert_eq!(msg.kind, MessageKind::Reply);
    assert_eq!(msg.status(), Some(ReplyStatus::Fail));
    assert!(!msg.is_ok());
    assert_eq!(msg.payload(), ["register vacc_ctrl is read-only".to_string()]);
}

#[test]
fn test_inform_with_id_keeps_all_arguments() {
    let (msg, _) = decode_message(b"#progress[4] 3 of 8\n").unwrap();
    assert_eq!(msg.kind, MessageKind::Inform);
    assert_eq!(msg.id, Some(4));
    assert_eq!(msg.arguments, vec!["3", "of", "8"]);
}

#[test]
fn test_sequence_counter_ids_are_accepted_by_the_codec() {
    let ids = SequenceCounter::new();
    for _ in 0..100 {
        let msg = Message::request("watchdog", Some(ids.next()), vec![]);
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap().0, msg);
    }
}

#[test]
fn test_corrupt_line_is_reported_not_skipped() {
    let result = decode_message(b"garbage\n?watchdog\n");
    assert_eq!(result, Err(ProtocolError::UnknownSigil(b'g')));
}
