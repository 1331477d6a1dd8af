//! Packed register codec: declarative bit layouts and the generic
//! decode/encode pair built on them.
//!
//! - **`layout`** – [`FieldSpec`] / [`RegisterLayout`] tables and their
//!   compile-time validation.
//! - **`snapshot`** – [`RegisterSnapshot`], the decoded, mutable view of one
//!   word, plus [`decode`] and [`encode`].
//! - **`catalog`** – the layouts of the firmware registers used by the
//!   synchronisation protocols.

pub mod catalog;
pub mod layout;
pub mod snapshot;

pub use layout::{FieldKind, FieldSpec, LayoutError, RegisterLayout, REGISTER_BITS};
pub use snapshot::{decode, encode, FieldValue, RegisterSnapshot};
