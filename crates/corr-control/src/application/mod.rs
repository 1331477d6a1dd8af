//! Application layer: request tracking, register access and the cluster
//! synchronisation protocols.
//!
//! # What is the "application" layer? (for beginners)
//!
//! This layer knows *what* has to be said to a board and in which order, but
//! not *how* bytes reach it.  Everything here talks to boards through the
//! [`registers::RegisterBus`] trait and reads time through the
//! [`clock::Clock`] trait, so the same code drives real TCP connections, the
//! in-memory simulated board and the unit-test mocks.
//!
//! It contains no sockets, no file system access and no system clock calls.
//!
//! # Sub-modules
//!
//! - **`request_tracker`** – Matches replies and informs to the request that
//!   caused them, with timeouts and a bound on outstanding requests.
//!
//! - **`registers`** – Read, read-modify-write and pulse operations on named
//!   register fields, singly or across many boards at once.
//!
//! - **`cluster`** – The set of boards being driven and the errors the
//!   synchronisation protocols report about them.
//!
//! - **`arm`** – Zeroes every board's sample counter on a common PPS edge
//!   and publishes the resulting epoch.
//!
//! - **`schedule`** – Makes every board start accumulating at the same
//!   future packet count, then checks that each one did.
//!
//! - **`retry`** / **`clock`** – Bounded polling and the time source it runs
//!   against.

pub mod arm;
pub mod clock;
pub mod cluster;
pub mod registers;
pub mod request_tracker;
pub mod retry;
pub mod schedule;
