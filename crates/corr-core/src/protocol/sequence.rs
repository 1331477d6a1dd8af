//! Thread-safe allocator for protocol message ids.
//!
//! Message ids correlate a request with its replies and informs.  They must be
//! positive (`[0]` is not a legal id on the wire) and must not repeat while a
//! request is outstanding, so the allocator hands out a strictly increasing
//! sequence starting at 1 and skips 0 if it ever wraps.
//!
//! # Thread safety
//!
//! The counter is a single `AtomicU64`.  `fetch_add` reads, increments and
//! writes in one indivisible step, so any number of threads can allocate ids
//! concurrently without a lock and without two callers receiving the same id.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::messages::MessageId;

/// A lock-free, monotonically increasing source of message ids.
///
/// `new` is a `const fn`, so the allocator can live in a `static` and be
/// shared by every connection in the process.
///
/// # Examples
///
/// ```rust
/// use corr_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a counter whose first id is 1.
    pub const fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next id and atomically advances the counter.
    ///
    /// `Relaxed` ordering is enough: the id is only used as a unique key, it
    /// does not publish any other memory.
    pub fn next(&self) -> MessageId {
        loop {
            let id = self.inner.fetch_add(1, Ordering::Relaxed);
            // 0 only appears after wrapping past u64::MAX.
            if id != 0 {
                return id;
            }
        }
    }

    /// Returns the id the next call to [`next`](Self::next) will hand out,
    /// without advancing.  Only meaningful for diagnostics.
    pub fn current(&self) -> MessageId {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_one() {
        // Arrange
        let counter = SequenceCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 1);
    }

    #[test]
    fn test_sequence_counter_increments_monotonically() {
        let counter = SequenceCounter::new();

        let values: Vec<u64> = (0..100).map(|_| counter.next()).collect();

        for window in values.windows(2) {
            assert!(
                window[1] > window[0],
                "values must be monotonically increasing"
            );
        }
    }

    #[test]
    fn test_sequence_counter_skips_zero_after_wrap() {
        // Arrange – start the counter one step before overflow
        let counter = SequenceCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        // Act
        let before_wrap = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(before_wrap, u64::MAX);
        assert_eq!(after_wrap, 1, "0 is not a legal message id");
    }

    #[test]
    fn test_sequence_counter_is_thread_safe() {
        let counter = Arc::new(SequenceCounter::new());
        let thread_count = 8;
        let increments_per_thread = 1000;

        let handles: Vec<_> = (0..thread_count)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    (0..increments_per_thread)
                        .map(|_| c.next())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all_values: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no two threads got the same id
        all_values.sort_unstable();
        all_values.dedup();
        assert_eq!(all_values.len(), thread_count * increments_per_thread);
    }

    #[test]
    fn test_current_does_not_increment() {
        let counter = SequenceCounter::new();
        counter.next();

        let current = counter.current();
        let next = counter.next();

        assert_eq!(current, 2);
        assert_eq!(next, 2);
    }

    #[test]
    fn test_counter_usable_from_a_static() {
        static SHARED: SequenceCounter = SequenceCounter::new();
        let a = SHARED.next();
        let b = SHARED.next();
        assert!(b > a);
    }
}
