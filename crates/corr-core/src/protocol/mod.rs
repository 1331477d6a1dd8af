//! Protocol module containing message types, the line codec and the id allocator.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_message, encode_message, ProtocolError};
pub use messages::*;
pub use sequence::SequenceCounter;
