//! Counter/time model.
//!
//! Boards count samples with wrapping hardware counters that all read zero
//! at the synchronisation instant.  [`Epoch`] records that instant, and the
//! functions in [`counter`] convert between wall-clock time and counter
//! values relative to it.

pub mod counter;
pub mod epoch;

pub use counter::{
    counter_delta, counter_from_time, time_from_counter, CounterSpec, Timestamp, TimingError,
};
pub use epoch::{Epoch, EpochCell, VersionedEpoch, GLOBAL_EPOCH};
