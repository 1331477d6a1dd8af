//! Scheduled action: makes every board's accumulator start at the same
//! future packet count.
//!
//! # Sequence
//!
//! ```text
//! pre-check ─▶ read vacc_status ─▶ [reset + verify] ─▶ load time ─▶ sleep ─▶ verify
//! ```
//!
//! 1. Refuse a target that leaves less than the minimum lead time.
//! 2. Record each board's `arm_count` / `load_count`.  If any board shows
//!    them unequal, an earlier load is still pending somewhere: reset the
//!    counters on every board and confirm they read zero.
//! 3. Convert the target to a packet count against the current epoch and
//!    write it high word, low word, then toggle the commit bit.
//! 4. Sleep until the target plus a network allowance.
//! 5. Re-read the counters.  A board committed the load only if both
//!    counters advanced.

use std::time::Duration;

use corr_core::register::catalog::{
    split_load_time, VACC_COUNTER_BITS, VACC_CTRL, VACC_LOAD_LSB, VACC_LOAD_MSB, VACC_STATUS,
};
use corr_core::register::{decode, FieldValue, RegisterSnapshot};
use corr_core::timing::{counter_delta, EpochCell, Timestamp};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::application::cluster::{BoardId, Cluster, SyncError};
use crate::application::clock::Clock;
use crate::application::registers::{
    pulse_many, read, read_many, store, RegisterAccessError, RegisterBus,
};
use crate::application::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Smallest gap between now and the target that is still safe to write.
    pub min_lead: Duration,
    /// Extra time slept past the target before verifying.
    pub network_allowance: Duration,
    /// How a counter reset is confirmed.
    pub reset_verify: RetryPolicy,
}

/// When the action should happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTarget {
    At(Timestamp),
    /// As soon as the minimum lead time allows.
    Asap,
}

/// `arm_count` and `load_count` of one board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LoadCounters {
    pub arm_count: u32,
    pub load_count: u32,
}

impl LoadCounters {
    fn from_snapshot(snapshot: &RegisterSnapshot) -> Result<Self, RegisterAccessError> {
        Ok(Self {
            arm_count: snapshot.unsigned("arm_count")?,
            load_count: snapshot.unsigned("load_count")?,
        })
    }

    fn is_settled(&self) -> bool {
        self.arm_count == self.load_count
    }

    fn is_zero(&self) -> bool {
        self.arm_count == 0 && self.load_count == 0
    }
}

/// What was written, and the counters it will be judged against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleTicket {
    pub epoch_version: u64,
    pub target_time: Timestamp,
    pub target_pcnt: u64,
    pub before: Vec<(BoardId, LoadCounters)>,
}

/// Verdict for one board.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum LoadVerdict {
    Committed,
    /// `arm_count` did not advance: the load time was never latched.
    DidNotArm,
    /// Latched but did not load, and the target had already passed.
    MissedDeadline { overshoot_ms: f64 },
    /// Latched but did not load before the target.
    UnknownLoadFailure,
    /// The load time could not be written.
    WriteFailed { error: String },
    /// The counters could not be read back.
    Unreachable { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardLoadResult {
    pub board: BoardId,
    pub before: LoadCounters,
    pub after: Option<LoadCounters>,
    #[serde(flatten)]
    pub verdict: LoadVerdict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub epoch_version: u64,
    pub target_time: Timestamp,
    pub target_pcnt: u64,
    /// Whether the accumulator counters were reset first.
    pub reset_issued: bool,
    pub verified_at: Timestamp,
    pub boards: Vec<BoardLoadResult>,
}

impl ScheduleReport {
    pub fn all_committed(&self) -> bool {
        self.boards.iter().all(|b| b.verdict == LoadVerdict::Committed)
    }

    pub fn failed(&self) -> Vec<BoardId> {
        self.boards
            .iter()
            .filter(|b| b.verdict != LoadVerdict::Committed)
            .map(|b| b.board.clone())
            .collect()
    }
}

/// Schedules the accumulator load on every board of `cluster` and reports
/// per-board verdicts.
///
/// Only pre-write failures are errors; anything that goes wrong after the
/// first load-time write is reported per board in the [`ScheduleReport`].
///
/// # Errors
///
/// - [`SyncError::ScheduleInPast`] before any register access.
/// - [`SyncError::NoEpoch`] if the cluster has never been armed.
/// - [`SyncError::Register`] if the initial counter read or the reset fails.
/// - [`SyncError::CounterResetFailed`] if a reset did not zero the counters.
/// - [`SyncError::TargetOutOfRange`] if the packet count does not fit the
///   load-time registers or lies beyond half a packet-counter wrap.
pub async fn schedule_action(
    cluster: &Cluster,
    clock: &dyn Clock,
    epochs: &EpochCell,
    target: ScheduleTarget,
    settings: &ScheduleSettings,
) -> Result<ScheduleReport, SyncError> {
    if cluster.is_empty() {
        return Err(SyncError::EmptyCluster);
    }
    let mut target_time = resolve_target(target, clock.now(), settings.min_lead)?;
    let current = epochs.load().ok_or(SyncError::NoEpoch)?;

    let mut before = read_counters(cluster).await?;
    let reset_issued = before.iter().any(|c| !c.is_settled());
    if reset_issued {
        warn!("Accumulator counters disagree; resetting before scheduling");
        before = reset_counters(cluster, clock, &settings.reset_verify).await?;
        target_time = resolve_target(target, clock.now(), settings.min_lead)?;
    }

    let target_pcnt = current.epoch.pcnt_from_time(target_time);
    let (high, low) = split_load_time(target_pcnt).ok_or(SyncError::TargetOutOfRange(target_pcnt))?;
    // Boards compare against a wrapping counter; a target more than half a
    // wrap ahead would already look passed.
    let now_pcnt = current.epoch.pcnt_from_time(clock.now());
    if current.epoch.pcnt_delta(target_pcnt, now_pcnt) <= 0 {
        return Err(SyncError::TargetOutOfRange(target_pcnt));
    }
    let ticket = ScheduleTicket {
        epoch_version: current.version,
        target_time,
        target_pcnt,
        before: cluster.ids().into_iter().zip(before).collect(),
    };
    info!(
        target = %ticket.target_time,
        pcnt = ticket.target_pcnt,
        version = ticket.epoch_version,
        "Scheduling accumulator load"
    );

    let writes = futures_util::future::join_all(
        cluster
            .boards()
            .iter()
            .map(|b| write_load_time(b.bus.as_ref(), high, low)),
    )
    .await;

    clock
        .sleep_until(target_time + settings.network_allowance)
        .await;

    let after = read_many(&cluster.buses(), &VACC_STATUS).await;
    let verified_at = clock.now();
    let boards = ticket
        .before
        .iter()
        .zip(writes)
        .zip(after)
        .map(|(((board, before), written), after)| {
            let after = after.and_then(|s| LoadCounters::from_snapshot(&s));
            let verdict = judge(*before, written, after.as_ref(), target_time, verified_at);
            if verdict != LoadVerdict::Committed {
                warn!(board = %board, ?verdict, "Accumulator load not confirmed");
            }
            BoardLoadResult {
                board: board.clone(),
                before: *before,
                after: after.ok(),
                verdict,
            }
        })
        .collect();

    let report = ScheduleReport {
        epoch_version: ticket.epoch_version,
        target_time,
        target_pcnt,
        reset_issued,
        verified_at,
        boards,
    };
    if report.all_committed() {
        info!(target = %target_time, "Accumulator load committed on all boards");
    }
    Ok(report)
}

fn resolve_target(
    target: ScheduleTarget,
    now: Timestamp,
    min_lead: Duration,
) -> Result<Timestamp, SyncError> {
    let earliest = now + min_lead;
    match target {
        ScheduleTarget::Asap => Ok(earliest),
        ScheduleTarget::At(t) if t < earliest => Err(SyncError::ScheduleInPast {
            target: t,
            earliest,
        }),
        ScheduleTarget::At(t) => Ok(t),
    }
}

async fn read_counters(cluster: &Cluster) -> Result<Vec<LoadCounters>, SyncError> {
    let reads = read_many(&cluster.buses(), &VACC_STATUS).await;
    cluster
        .ids()
        .into_iter()
        .zip(reads)
        .map(|(board, outcome)| {
            outcome
                .and_then(|s| LoadCounters::from_snapshot(&s))
                .map_err(|source| SyncError::Register { board, source })
        })
        .collect()
}

async fn reset_counters(
    cluster: &Cluster,
    clock: &dyn Clock,
    verify: &RetryPolicy,
) -> Result<Vec<LoadCounters>, SyncError> {
    let pulses = pulse_many(&cluster.buses(), &VACC_CTRL, &["reset"]).await;
    for (board, outcome) in cluster.ids().into_iter().zip(pulses) {
        outcome.map_err(|source| SyncError::Register { board, source })?;
    }

    let ids = cluster.ids();
    let ids = ids.as_slice();
    let verified = verify
        .run(clock, move |attempt| {
            async move {
                let counters = read_many(&cluster.buses(), &VACC_STATUS).await;
                let mut zeroed = Vec::with_capacity(counters.len());
                let mut stuck = Vec::new();
                for (board, outcome) in ids.iter().zip(counters) {
                    match outcome.and_then(|s| LoadCounters::from_snapshot(&s)) {
                        Ok(c) if c.is_zero() => zeroed.push(c),
                        _ => stuck.push(board.clone()),
                    }
                }
                debug!(attempt, stuck = stuck.len(), "Verifying counter reset");
                if stuck.is_empty() {
                    Ok(zeroed)
                } else {
                    Err(stuck)
                }
            }
        })
        .await;
    verified.map_err(|e| SyncError::CounterResetFailed { boards: e.last })
}

/// High word with commit low, low word, then commit high and low again.
async fn write_load_time(
    bus: &dyn RegisterBus,
    high: u32,
    low: u32,
) -> Result<(), RegisterAccessError> {
    let mut msb = read(bus, &VACC_LOAD_MSB).await?;
    msb.apply(&[("time_msb", FieldValue::Unsigned(high)), ("commit", false.into())])?;
    store(bus, &msb).await?;

    store(bus, &decode(&VACC_LOAD_LSB, low)?).await?;

    for commit in [true, false] {
        msb.set("commit", commit.into())?;
        store(bus, &msb).await?;
    }
    Ok(())
}

fn judge(
    before: LoadCounters,
    written: Result<(), RegisterAccessError>,
    after: Result<&LoadCounters, &RegisterAccessError>,
    target: Timestamp,
    now: Timestamp,
) -> LoadVerdict {
    if let Err(e) = written {
        return LoadVerdict::WriteFailed {
            error: e.to_string(),
        };
    }
    let after = match after {
        Ok(after) => after,
        Err(e) => {
            return LoadVerdict::Unreachable {
                error: e.to_string(),
            }
        }
    };
    let advanced = |a: u32, b: u32| counter_delta(VACC_COUNTER_BITS, u64::from(a), u64::from(b)) > 0;
    if !advanced(after.arm_count, before.arm_count) {
        return LoadVerdict::DidNotArm;
    }
    if advanced(after.load_count, before.load_count) {
        return LoadVerdict::Committed;
    }
    if now >= target {
        LoadVerdict::MissedDeadline {
            overshoot_ms: now.nanos_since(target) as f64 / 1e6,
        }
    } else {
        LoadVerdict::UnknownLoadFailure
    }
}
