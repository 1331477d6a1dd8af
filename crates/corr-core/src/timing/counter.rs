//! Wall-clock timestamps, wrapping hardware counters and the conversions
//! between them.
//!
//! # Exact arithmetic
//!
//! Counter rates are rationals (`rate_num / rate_den` counts per second) and
//! timestamps are integer nanoseconds, so every conversion is done in `i128`
//! integer arithmetic with round-to-nearest.  As long as one count lasts at
//! least a nanosecond (rate ≤ 1 GHz, enforced by [`CounterSpec::new`]),
//! converting a counter value to a time and back recovers the value exactly.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Errors raised when constructing counter descriptions or epochs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimingError {
    #[error("counter rate {num}/{den} is not a positive rational with a 32-bit denominator")]
    InvalidRate { num: u64, den: u64 },

    #[error("counter rate {num}/{den} exceeds one count per nanosecond")]
    RateTooHigh { num: u64, den: u64 },

    #[error("counter width {0} is outside 1..=64 bits")]
    InvalidCounterBits(u32),

    #[error("pcnt ratio {0} is not a power of two smaller than the counter modulus")]
    InvalidRatio(u64),
}

// ── Timestamp ─────────────────────────────────────────────────────────────────

/// A wall-clock instant in integer nanoseconds since the Unix epoch.
///
/// Stored as `i128` so that every value of a 64-bit counter, even at slow
/// rates, maps to a representable instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i128);

impl Timestamp {
    pub const fn from_nanos(nanos: i128) -> Self {
        Self(nanos)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs as i128 * NANOS_PER_SEC)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis as i128 * 1_000_000)
    }

    /// Converts fractional seconds, rounding to the nearest nanosecond.
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1e9).round() as i128)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(d.as_nanos() as i128),
            Err(e) => Self(-(e.duration().as_nanos() as i128)),
        }
    }

    pub const fn as_nanos(self) -> i128 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Whole seconds, rounded towards negative infinity.
    pub const fn floor_secs(self) -> i128 {
        self.0.div_euclid(NANOS_PER_SEC)
    }

    /// The instant truncated down to its whole second.
    pub const fn floor_to_second(self) -> Self {
        Self(self.floor_secs() * NANOS_PER_SEC)
    }

    /// Nanoseconds elapsed since the last whole second, in `0..1e9`.
    pub const fn subsec_nanos(self) -> i64 {
        self.0.rem_euclid(NANOS_PER_SEC) as i64
    }

    /// Signed distance `self - earlier` in nanoseconds.
    pub const fn nanos_since(self, earlier: Timestamp) -> i128 {
        self.0.saturating_sub(earlier.0)
    }

    /// `self - earlier` as a [`Duration`], or `None` if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Option<Duration> {
        u64::try_from(self.nanos_since(earlier))
            .ok()
            .map(Duration::from_nanos)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as i128))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_nanos() as i128))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.floor_secs(), self.subsec_nanos())
    }
}

// ── Counter description ───────────────────────────────────────────────────────

/// Rate and width of a wrapping hardware counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSpec {
    rate_num: u64,
    rate_den: u64,
    bits: u32,
}

impl CounterSpec {
    /// A counter advancing `rate_num / rate_den` times per second and
    /// wrapping at `2^bits`.
    ///
    /// # Errors
    ///
    /// Zero numerator or denominator, a denominator wider than 32 bits, a
    /// rate above 1 GHz, or `bits` outside `1..=64`.
    pub fn new(rate_num: u64, rate_den: u64, bits: u32) -> Result<Self, TimingError> {
        if rate_num == 0 || rate_den == 0 || rate_den > u64::from(u32::MAX) {
            return Err(TimingError::InvalidRate {
                num: rate_num,
                den: rate_den,
            });
        }
        if i128::from(rate_num) > NANOS_PER_SEC * i128::from(rate_den) {
            return Err(TimingError::RateTooHigh {
                num: rate_num,
                den: rate_den,
            });
        }
        if bits == 0 || bits > 64 {
            return Err(TimingError::InvalidCounterBits(bits));
        }
        Ok(Self {
            rate_num,
            rate_den,
            bits,
        })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Counts per second as a float, for display only.
    pub fn rate_hz(&self) -> f64 {
        self.rate_num as f64 / self.rate_den as f64
    }

    /// `2^bits`.
    pub fn modulus(&self) -> u128 {
        1u128 << self.bits
    }

    /// Reduces an unbounded count into `0..2^bits`.
    pub fn wrap(&self, count: i128) -> u64 {
        count.rem_euclid(self.modulus() as i128) as u64
    }

    /// Nanoseconds spanned by `counts` ticks, rounded to nearest.
    pub fn nanos_for_counts(&self, counts: i128) -> i128 {
        div_round(
            counts
                .saturating_mul(NANOS_PER_SEC)
                .saturating_mul(i128::from(self.rate_den)),
            i128::from(self.rate_num),
        )
    }

    /// Ticks elapsed in `nanos` nanoseconds, rounded to nearest and not wrapped.
    pub fn counts_for_nanos(&self, nanos: i128) -> i128 {
        div_round(
            nanos.saturating_mul(i128::from(self.rate_num)),
            NANOS_PER_SEC * i128::from(self.rate_den),
        )
    }
}

/// Signed integer division rounding half away from zero; `d` must be positive.
fn div_round(n: i128, d: i128) -> i128 {
    if n >= 0 {
        n.saturating_add(d / 2) / d
    } else {
        -(n.saturating_neg().saturating_add(d / 2) / d)
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

/// `sync_time + counter / rate`.
///
/// The counter is taken at face value: a counter that has wrapped maps to a
/// time within the first wrap period after `sync_time`.
pub fn time_from_counter(sync_time: Timestamp, spec: &CounterSpec, counter: u64) -> Timestamp {
    Timestamp::from_nanos(
        sync_time
            .as_nanos()
            .saturating_add(spec.nanos_for_counts(i128::from(counter))),
    )
}

/// `((time - sync_time) * rate) mod 2^bits`.
///
/// Times before `sync_time` produce the wrapped representation of a negative
/// count; schedulers must reject those themselves.
pub fn counter_from_time(sync_time: Timestamp, spec: &CounterSpec, time: Timestamp) -> u64 {
    let elapsed = time.nanos_since(sync_time);
    spec.wrap(spec.counts_for_nanos(elapsed))
}

/// Signed difference `a - b` of two `bits`-wide wrapping counters.
///
/// The result is the representative of `(a - b) mod 2^bits` closest to zero.
/// When the difference is exactly half the modulus the sign is taken from
/// comparing the reduced raw values, so `counter_delta(a, b) ==
/// -counter_delta(b, a)` holds for every pair.
pub fn counter_delta(bits: u32, a: u64, b: u64) -> i128 {
    let modulus = 1i128 << bits.clamp(1, 64);
    let (a, b) = (i128::from(a) % modulus, i128::from(b) % modulus);
    let diff = (a - b).rem_euclid(modulus);
    let half = modulus / 2;
    if diff < half {
        diff
    } else if diff > half {
        diff - modulus
    } else if a > b {
        half
    } else {
        -half
    }
}
