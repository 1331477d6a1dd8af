//! Arm protocol: establishes a new sync epoch across the cluster.
//!
//! # Sequence
//!
//! ```text
//!  Idle ──▶ WaitingForPulseEdge ──▶ Pulsed ──▶ PollingPerBoard ──▶ Synchronized
//!                                                     │
//!                                                     └──────────▶ Failed
//! ```
//!
//! 1. Optionally wait until the wall clock is early in a second, so the
//!    arm writes land well before the next one-pulse-per-second edge.
//! 2. Pulse `sync_ctrl.arm` on every board.
//! 3. The boards zero their sample counters on the next PPS edge.  The epoch
//!    is the start of the wall-clock second observed right after the pulse.
//! 4. Poll `sync_status.waiting` until every board has cleared it.
//! 5. Publish the new epoch.  Nothing is published if any board fails.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use corr_core::register::catalog::{SYNC_CTRL, SYNC_STATUS};
use corr_core::timing::{CounterSpec, Epoch, EpochCell, Timestamp};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::application::cluster::{Board, BoardId, Cluster, SyncError};
use crate::application::clock::Clock;
use crate::application::registers::{pulse_many, read, RegisterAccessError};
use crate::application::retry::{Exhausted, RetryPolicy};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Parameters of one arm attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmSettings {
    /// Arm only while the fractional second is below this.  `None` arms
    /// immediately.
    pub window: Option<Duration>,
    /// How `sync_status` is polled after the pulse.
    pub poll: RetryPolicy,
    /// Geometry of the boards' sample counter.
    pub mcnt: CounterSpec,
    /// Samples per packet; must be a power of two.
    pub pcnt_ratio: u64,
}

/// Progress of an arm attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArmPhase {
    Idle,
    WaitingForPulseEdge,
    Pulsed,
    PollingPerBoard,
    Synchronized,
    Failed,
}

/// What one board reported during the arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BoardArmStatus {
    Synchronized { pulse_count: u32 },
    /// Still waiting for the PPS edge when polling gave up.
    StillWaiting,
    /// The arm pulse itself could not be written.
    PulseFailed { error: String },
    /// `sync_status` could not be read on the last poll.
    Unreachable { error: String },
}

impl BoardArmStatus {
    pub fn is_synchronized(&self) -> bool {
        matches!(self, BoardArmStatus::Synchronized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardArmResult {
    pub board: BoardId,
    #[serde(flatten)]
    pub status: BoardArmStatus,
}

/// Outcome of an arm attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArmReport {
    pub phase: ArmPhase,
    /// Wall-clock time read right after the pulse.
    pub armed_at: Timestamp,
    /// The new epoch, when one was published.
    pub sync_time: Option<Timestamp>,
    pub epoch_version: Option<u64>,
    /// Number of `sync_status` polls issued per board.
    pub polls: u32,
    pub boards: Vec<BoardArmResult>,
}

impl ArmReport {
    /// Boards that did not synchronise.
    pub fn failed(&self) -> Vec<BoardId> {
        self.boards
            .iter()
            .filter(|b| !b.status.is_synchronized())
            .map(|b| b.board.clone())
            .collect()
    }
}

/// Arms every board in `cluster` and publishes the resulting epoch to
/// `epochs`.
///
/// # Errors
///
/// - [`SyncError::EmptyCluster`] if there is nothing to arm.
/// - [`SyncError::Timing`] if the counter geometry is invalid; nothing is
///   written in that case.
/// - [`SyncError::PartialArmFailure`] if any board failed the pulse or was
///   still waiting when polling gave up.  The previous epoch stays current.
pub async fn arm(
    cluster: &Cluster,
    clock: &dyn Clock,
    epochs: &EpochCell,
    settings: &ArmSettings,
) -> Result<ArmReport, SyncError> {
    if cluster.is_empty() {
        return Err(SyncError::EmptyCluster);
    }
    // Reject bad geometry before touching any board.
    Epoch::new(Timestamp::from_secs(0), settings.mcnt, settings.pcnt_ratio)?;

    info!(boards = cluster.len(), "Arming cluster");
    let mut phase = ArmPhase::WaitingForPulseEdge;
    debug!(?phase);
    if let Some(window) = settings.window {
        wait_for_window(clock, window).await;
    }

    let pulses = pulse_many(&cluster.buses(), &SYNC_CTRL, &["arm"]).await;
    let armed_at = clock.now();
    phase = ArmPhase::Pulsed;
    debug!(?phase, armed_at = %armed_at);

    let mut statuses: Vec<Option<BoardArmStatus>> = vec![None; cluster.len()];
    let mut pollable = Vec::with_capacity(cluster.len());
    for (index, outcome) in pulses.into_iter().enumerate() {
        match outcome {
            Ok(()) => pollable.push(index),
            Err(e) => {
                warn!(board = %cluster.boards()[index].id, error = %e, "Arm pulse failed");
                statuses[index] = Some(BoardArmStatus::PulseFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    phase = ArmPhase::PollingPerBoard;
    debug!(?phase, boards = pollable.len());
    let boards = cluster.boards();
    let targets = pollable.as_slice();
    let attempts = AtomicU32::new(0);
    let counter = &attempts;
    let polled = match settings
        .poll
        .run(clock, move |n| {
            counter.store(n, Ordering::Relaxed);
            poll_once(boards, targets)
        })
        .await
    {
        Ok(polled) => polled,
        Err(Exhausted { last, .. }) => last,
    };
    let polls = attempts.load(Ordering::Relaxed);

    for (index, status) in polled {
        statuses[index] = Some(status);
    }
    let boards: Vec<BoardArmResult> = cluster
        .boards()
        .iter()
        .zip(statuses)
        .map(|(board, status)| BoardArmResult {
            board: board.id.clone(),
            status: status.unwrap_or(BoardArmStatus::StillWaiting),
        })
        .collect();

    let mut report = ArmReport {
        phase: ArmPhase::Failed,
        armed_at,
        sync_time: None,
        epoch_version: None,
        polls,
        boards,
    };

    let failed = report.failed();
    if !failed.is_empty() {
        warn!(failed = failed.len(), "Arm failed; epoch not published");
        return Err(SyncError::PartialArmFailure {
            failed,
            report: Box::new(report),
        });
    }

    let sync_time = armed_at.floor_to_second();
    let epoch = Epoch::new(sync_time, settings.mcnt, settings.pcnt_ratio)?;
    let version = epochs.publish(epoch);
    report.phase = ArmPhase::Synchronized;
    report.sync_time = Some(sync_time);
    report.epoch_version = Some(version);
    info!(sync_time = %sync_time, version, "Cluster synchronised");
    Ok(report)
}

/// Sleeps to the next whole second unless the clock is already inside the
/// first `window` of the current one.
async fn wait_for_window(clock: &dyn Clock, window: Duration) {
    let into_second = clock.now().subsec_nanos();
    let window_nanos = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
    if into_second >= window_nanos {
        let remaining = (NANOS_PER_SEC - into_second) as u64;
        debug!(remaining_ms = remaining / 1_000_000, "Waiting for arm window");
        clock.sleep(Duration::from_nanos(remaining)).await;
    }
}

type Polled = Vec<(usize, BoardArmStatus)>;

async fn poll_once(boards: &[Board], targets: &[usize]) -> Result<Polled, Polled> {
    let reads = join_all(targets.iter().map(|&i| read(boards[i].bus.as_ref(), &SYNC_STATUS))).await;
    let polled: Polled = targets
        .iter()
        .zip(reads)
        .map(|(&i, outcome)| (i, status_from(outcome)))
        .collect();
    if polled.iter().all(|(_, s)| s.is_synchronized()) {
        Ok(polled)
    } else {
        Err(polled)
    }
}

fn status_from(
    outcome: Result<corr_core::register::RegisterSnapshot, RegisterAccessError>,
) -> BoardArmStatus {
    let snapshot = match outcome {
        Ok(snapshot) => snapshot,
        Err(e) => {
            return BoardArmStatus::Unreachable {
                error: e.to_string(),
            }
        }
    };
    match (snapshot.flag("waiting"), snapshot.unsigned("pulse_count")) {
        (Ok(false), Ok(pulse_count)) => BoardArmStatus::Synchronized { pulse_count },
        (Ok(true), _) => BoardArmStatus::StillWaiting,
        (Err(e), _) | (_, Err(e)) => BoardArmStatus::Unreachable {
            error: e.to_string(),
        },
    }
}
