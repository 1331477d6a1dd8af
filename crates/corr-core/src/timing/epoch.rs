//! The synchronisation epoch and its process-wide, versioned holder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::timing::counter::{
    counter_delta, counter_from_time, time_from_counter, CounterSpec, Timestamp, TimingError,
};

/// The instant at which every board's sample counter read zero, together
/// with the counter geometry needed to convert between counts and time.
///
/// `pcnt` is the coarse packet counter, `mcnt >> log2(pcnt_ratio)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    sync_time: Timestamp,
    mcnt: CounterSpec,
    pcnt_ratio: u64,
}

impl Epoch {
    /// # Errors
    ///
    /// [`TimingError::InvalidRatio`] unless `pcnt_ratio` is a power of two
    /// strictly smaller than the `mcnt` modulus.
    pub fn new(
        sync_time: Timestamp,
        mcnt: CounterSpec,
        pcnt_ratio: u64,
    ) -> Result<Self, TimingError> {
        if !pcnt_ratio.is_power_of_two() || u128::from(pcnt_ratio) >= mcnt.modulus() {
            return Err(TimingError::InvalidRatio(pcnt_ratio));
        }
        Ok(Self {
            sync_time,
            mcnt,
            pcnt_ratio,
        })
    }

    pub fn sync_time(&self) -> Timestamp {
        self.sync_time
    }

    pub fn mcnt(&self) -> &CounterSpec {
        &self.mcnt
    }

    pub fn pcnt_ratio(&self) -> u64 {
        self.pcnt_ratio
    }

    /// Width of the packet counter: `mcnt` bits minus the ratio's shift.
    pub fn pcnt_bits(&self) -> u32 {
        self.mcnt.bits() - self.pcnt_ratio.trailing_zeros()
    }

    pub fn mcnt_from_time(&self, time: Timestamp) -> u64 {
        counter_from_time(self.sync_time, &self.mcnt, time)
    }

    pub fn time_from_mcnt(&self, mcnt: u64) -> Timestamp {
        time_from_counter(self.sync_time, &self.mcnt, mcnt)
    }

    pub fn pcnt_from_time(&self, time: Timestamp) -> u64 {
        self.mcnt_from_time(time) >> self.pcnt_ratio.trailing_zeros()
    }

    pub fn time_from_pcnt(&self, pcnt: u64) -> Timestamp {
        let shift = self.pcnt_ratio.trailing_zeros();
        let mcnt = (u128::from(pcnt) << shift) % self.mcnt.modulus();
        self.time_from_mcnt(mcnt as u64)
    }

    /// Signed `a - b` of two packet counts, accounting for wraparound.
    pub fn pcnt_delta(&self, a: u64, b: u64) -> i128 {
        counter_delta(self.pcnt_bits(), a, b)
    }
}

/// An [`Epoch`] tagged with the version under which it was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionedEpoch {
    pub version: u64,
    pub epoch: Epoch,
}

/// Read-mostly holder of the current epoch.
///
/// Readers get an `Arc` to a complete [`VersionedEpoch`], so a concurrent
/// publish is observed either entirely or not at all.  Every publish bumps
/// the version; a version of `0` means nothing has been published yet.
///
/// # Example
///
/// ```rust
/// use corr_core::timing::{CounterSpec, Epoch, EpochCell, Timestamp};
///
/// let cell = EpochCell::new();
/// assert!(cell.load().is_none());
///
/// let mcnt = CounterSpec::new(250_000_000, 1, 48).unwrap();
/// let epoch = Epoch::new(Timestamp::from_secs(100), mcnt, 2048).unwrap();
/// let version = cell.publish(epoch);
///
/// assert_eq!(version, 1);
/// assert_eq!(cell.load().unwrap().epoch, epoch);
/// ```
#[derive(Debug)]
pub struct EpochCell {
    current: RwLock<Option<Arc<VersionedEpoch>>>,
    version: AtomicU64,
}

impl EpochCell {
    pub const fn new() -> Self {
        Self {
            current: RwLock::new(None),
            version: AtomicU64::new(0),
        }
    }

    /// The most recently published epoch, if any.
    pub fn load(&self) -> Option<Arc<VersionedEpoch>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the current epoch and returns its new version.
    pub fn publish(&self, epoch: Epoch) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        *guard = Some(Arc::new(VersionedEpoch { version, epoch }));
        debug!(version, sync_time = %epoch.sync_time, "Epoch published");
        version
    }

    /// Version of the current epoch, `0` before the first publish.
    pub fn version(&self) -> u64 {
        self.load().map_or(0, |v| v.version)
    }

    /// Forgets the current epoch.  The version counter keeps increasing.
    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Default for EpochCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The epoch shared by everything in this process.
pub static GLOBAL_EPOCH: EpochCell = EpochCell::new();

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn epoch_at(secs: i64) -> Epoch {
        let mcnt = CounterSpec::new(250_000_000, 1, 48).unwrap();
        Epoch::new(Timestamp::from_secs(secs), mcnt, 2048).unwrap()
    }

    #[test]
    fn test_epoch_rejects_non_power_of_two_ratio() {
        let mcnt = CounterSpec::new(1_000, 1, 16).unwrap();
        assert_eq!(
            Epoch::new(Timestamp::from_secs(0), mcnt, 1000),
            Err(TimingError::InvalidRatio(1000))
        );
        assert_eq!(
            Epoch::new(Timestamp::from_secs(0), mcnt, 1 << 16),
            Err(TimingError::InvalidRatio(1 << 16))
        );
    }

    #[test]
    fn test_pcnt_is_mcnt_shifted_by_ratio() {
        let epoch = epoch_at(100);
        let t = Timestamp::from_secs(101);
        assert_eq!(epoch.mcnt_from_time(t), 250_000_000);
        assert_eq!(epoch.pcnt_from_time(t), 250_000_000 / 2048);
        assert_eq!(epoch.pcnt_bits(), 48 - 11);
    }

    #[test]
    fn test_pcnt_delta_wraps_at_pcnt_width() {
        let epoch = epoch_at(100);
        let top = (1u64 << epoch.pcnt_bits()) - 1;
        assert_eq!(epoch.pcnt_delta(1, top), 2);
        assert_eq!(epoch.pcnt_delta(top, 1), -2);
    }

    #[test]
    fn test_time_from_pcnt_lands_on_packet_boundary() {
        let epoch = epoch_at(100);
        let pcnt = 1_000;
        let t = epoch.time_from_pcnt(pcnt);
        assert_eq!(epoch.pcnt_from_time(t), pcnt);
        assert_eq!(epoch.mcnt_from_time(t), pcnt * 2048);
    }

    #[test]
    fn test_publish_bumps_version_and_replaces_epoch() {
        // Arrange
        let cell = EpochCell::new();
        assert_eq!(cell.version(), 0);

        // Act
        let v1 = cell.publish(epoch_at(100));
        let v2 = cell.publish(epoch_at(200));

        // Assert
        assert_eq!((v1, v2), (1, 2));
        let current = cell.load().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.epoch.sync_time(), Timestamp::from_secs(200));
    }

    #[test]
    fn test_clear_keeps_version_monotonic() {
        let cell = EpochCell::new();
        cell.publish(epoch_at(1));
        cell.clear();
        assert!(cell.load().is_none());
        assert_eq!(cell.publish(epoch_at(2)), 2);
    }

    #[test]
    fn test_readers_never_see_mismatched_version_and_epoch() {
        // Publishing epoch N at sync time N lets readers check consistency.
        let cell = Arc::new(EpochCell::new());
        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for secs in 1..=500 {
                    cell.publish(epoch_at(secs));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        if let Some(v) = cell.load() {
                            assert_eq!(v.epoch.sync_time(), Timestamp::from_secs(v.version as i64));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cell.version(), 500);
    }
}
