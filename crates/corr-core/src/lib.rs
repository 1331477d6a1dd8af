//! # corr-core
//!
//! Shared library for the correlator control plane containing the line
//! protocol codec, the packed register codec and the counter/time model.
//!
//! It has no dependencies on sockets, async runtimes or the filesystem, so
//! everything here can be unit-tested without a board.
//!
//! # Architecture overview (for beginners)
//!
//! A correlator is a cluster of FPGA boards.  Each board samples antenna
//! signals, counts samples with a hardware counter, and exposes its firmware
//! registers over a text-based TCP protocol.  The control plane must make all
//! boards agree on *when* counting started (the sync epoch) and then ask them
//! to do things at a common future instant.
//!
//! This crate (`corr-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How requests, replies and informs are framed on the
//!   wire: one line per message, a sigil (`?`, `!`, `#`), a name, an optional
//!   `[id]` and escaped, space-separated arguments.
//!
//! - **`register`** – How named fields are packed into 32-bit register
//!   words.  Layouts are static tables validated at compile time; a snapshot
//!   is the decoded, editable form of one word.
//!
//! - **`timing`** – How wall-clock time maps onto wrapping hardware counters,
//!   and the versioned [`Epoch`] every conversion is relative to.

pub mod protocol;
pub mod register;
pub mod timing;

// Re-export the most-used types at the crate root so callers can write
// `corr_core::Message` instead of `corr_core::protocol::messages::Message`.
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::{Message, MessageId, MessageKind, ReplyStatus};
pub use register::{FieldValue, LayoutError, RegisterLayout, RegisterSnapshot};
pub use timing::{CounterSpec, Epoch, EpochCell, Timestamp, TimingError};
