//! Integration tests for the arm and scheduled-action protocols.
//!
//! # Purpose
//!
//! These tests drive whole clusters of simulated boards through the public
//! protocol functions, with a manual clock so that seconds of protocol time
//! pass instantly.  They verify:
//!
//! - The epoch is the whole second observed right after the arm pulse.
//! - A board that never sees its PPS edge fails the arm by name, and
//!   re-arming just that board succeeds once it recovers.
//! - A scheduled load lands on every board at the same packet count.
//! - A target in the past is refused before any register is written.
//! - Boards that miss the load, never latch it, or disagree about earlier
//!   loads are each reported the way an operator needs to see them.

use std::sync::Arc;
use std::time::Duration;

use corr_control::application::arm::{arm, ArmSettings, BoardArmStatus};
use corr_control::application::clock::Clock;
use corr_control::application::cluster::{Board, BoardId, BoardRole, Cluster, SyncError};
use corr_control::application::retry::RetryPolicy;
use corr_control::application::schedule::{
    schedule_action, LoadCounters, LoadVerdict, ScheduleSettings, ScheduleTarget,
};
use corr_control::infrastructure::board::{simulated_cluster, SimulatedBoard, SimulatedFaults};
use corr_control::infrastructure::clock::ManualClock;
use corr_core::register::catalog::join_load_time;
use corr_core::timing::{CounterSpec, EpochCell, Timestamp};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn arm_settings() -> ArmSettings {
    ArmSettings {
        window: None,
        poll: RetryPolicy::fixed(Duration::from_millis(100), Some(Duration::from_secs(2))),
        mcnt: CounterSpec::new(250_000_000, 1, 48).unwrap(),
        pcnt_ratio: 2048,
    }
}

fn schedule_settings() -> ScheduleSettings {
    ScheduleSettings {
        min_lead: Duration::from_secs(2),
        network_allowance: Duration::from_millis(200),
        reset_verify: RetryPolicy::attempts(3, Duration::from_millis(50)),
    }
}

/// Four healthy boards, armed at 100.52 s so the epoch is 100 s.
async fn armed_cluster() -> (Cluster, Vec<Arc<SimulatedBoard>>, ManualClock, EpochCell) {
    let (cluster, sims) = simulated_cluster(4);
    let clock = ManualClock::new(Timestamp::from_millis(100_520));
    let epochs = EpochCell::new();
    arm(&cluster, &clock, &epochs, &arm_settings()).await.unwrap();
    for sim in &sims {
        sim.clear_writes();
    }
    (cluster, sims, clock, epochs)
}

fn inject(sim: &SimulatedBoard, faults: SimulatedFaults) {
    sim.set_faults(faults);
}

// ── Arm ───────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_arm_four_boards_epoch_is_whole_second() {
    // Arrange
    let (cluster, sims) = simulated_cluster(4);
    let clock = ManualClock::new(Timestamp::from_millis(100_520));
    let epochs = EpochCell::new();

    // Act
    let report = arm(&cluster, &clock, &epochs, &arm_settings()).await.unwrap();

    // Assert
    assert_eq!(report.sync_time, Some(Timestamp::from_secs(100)));
    assert_eq!(epochs.load().unwrap().epoch.sync_time(), Timestamp::from_secs(100));
    assert!(report.boards.iter().all(|b| b.status.is_synchronized()));
    for sim in &sims {
        assert_eq!(sim.writes().len(), 3, "arm pulse must be exactly three writes");
    }
}

#[tokio::test]
async fn test_arm_waits_through_slow_pps_edge() {
    // Arrange: every board needs three polls before its edge arrives.
    let sims: Vec<_> = (0..2)
        .map(|n| Arc::new(SimulatedBoard::new(BoardId(format!("slow{n}"))).with_pps_delay(3)))
        .collect();
    let cluster = Cluster::new(
        sims.iter()
            .map(|s| Board {
                id: s.id().clone(),
                role: BoardRole::XEngine,
                bus: Arc::clone(s) as _,
            })
            .collect(),
    );
    let clock = ManualClock::new(Timestamp::from_millis(50_100));

    // Act
    let report = arm(&cluster, &clock, &EpochCell::new(), &arm_settings()).await.unwrap();

    // Assert
    assert_eq!(report.polls, 4);
    assert_eq!(report.sync_time, Some(Timestamp::from_secs(50)));
    assert_eq!(clock.now(), Timestamp::from_millis(50_400));
}

#[tokio::test]
async fn test_arm_names_board_without_pps_and_retry_on_subset_succeeds() {
    // Arrange
    let (cluster, sims) = simulated_cluster(4);
    inject(&sims[2], SimulatedFaults {
        no_pps: true,
        ..Default::default()
    });
    let clock = ManualClock::new(Timestamp::from_millis(100_520));
    let epochs = EpochCell::new();

    // Act
    let err = arm(&cluster, &clock, &epochs, &arm_settings()).await.unwrap_err();

    // Assert
    let SyncError::PartialArmFailure { failed, report } = err else {
        panic!("expected PartialArmFailure");
    };
    assert_eq!(failed, vec![BoardId("sim2:7147".into())]);
    assert_eq!(report.boards[2].status, BoardArmStatus::StillWaiting);
    assert!(epochs.load().is_none());

    // Act: the board recovers; re-arm only it.
    inject(&sims[2], SimulatedFaults::default());
    let retry = arm(&cluster.subset(&failed), &clock, &epochs, &arm_settings())
        .await
        .unwrap();

    // Assert
    assert_eq!(retry.boards.len(), 1);
    assert_eq!(epochs.version(), 1);
}

#[tokio::test]
async fn test_unreachable_board_fails_arm_pulse() {
    let (cluster, sims) = simulated_cluster(3);
    inject(&sims[0], SimulatedFaults {
        unreachable: true,
        ..Default::default()
    });
    let clock = ManualClock::new(Timestamp::from_secs(10));

    let err = arm(&cluster, &clock, &EpochCell::new(), &arm_settings()).await.unwrap_err();

    match err {
        SyncError::PartialArmFailure { report, .. } => {
            assert!(matches!(report.boards[0].status, BoardArmStatus::PulseFailed { .. }));
            assert!(report.boards[1].status.is_synchronized());
        }
        other => panic!("expected PartialArmFailure, got {other:?}"),
    }
}

// ── Scheduled action ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_schedule_latches_same_packet_count_everywhere() {
    // Arrange
    let (cluster, sims, clock, epochs) = armed_cluster().await;

    // Act
    let report = schedule_action(&cluster, &clock, &epochs, ScheduleTarget::Asap, &schedule_settings())
        .await
        .unwrap();

    // Assert
    assert!(report.all_committed(), "{report:?}");
    assert!(!report.reset_issued);
    assert_eq!(report.target_time, Timestamp::from_millis(102_520));
    // 2.52 s at 250 MHz is 630 000 000 samples, / 2048 per packet.
    assert_eq!(report.target_pcnt, 307_617);
    for sim in &sims {
        assert_eq!(sim.latched_load_time(), Some(report.target_pcnt));
        assert_eq!(sim.counters(), (1, 1));
    }
    assert!(clock.now() >= report.target_time + Duration::from_millis(200));
}

#[tokio::test]
async fn test_schedule_writes_high_low_then_commit_edge() {
    let (cluster, sims, clock, epochs) = armed_cluster().await;

    let report = schedule_action(&cluster, &clock, &epochs, ScheduleTarget::Asap, &schedule_settings())
        .await
        .unwrap();

    let writes = sims[0].writes();
    let registers: Vec<&str> = writes.iter().map(|(r, _)| r.as_str()).collect();
    assert_eq!(registers, ["vacc_load_msb", "vacc_load_lsb", "vacc_load_msb", "vacc_load_msb"]);
    let high = writes[0].1;
    let low = writes[1].1;
    assert_eq!(join_load_time(high, low), report.target_pcnt);
    assert_eq!(writes[2].1, high | 1 << 31);
    assert_eq!(writes[3].1, high);
}

#[tokio::test]
async fn test_schedule_in_past_writes_nothing() {
    // Arrange
    let (cluster, sims, clock, epochs) = armed_cluster().await;
    let target = ScheduleTarget::At(clock.now() - Duration::from_secs(5));

    // Act
    let result = schedule_action(&cluster, &clock, &epochs, target, &schedule_settings()).await;

    // Assert
    assert!(matches!(result, Err(SyncError::ScheduleInPast { .. })));
    for sim in &sims {
        assert!(sim.writes().is_empty());
    }
}

#[tokio::test]
async fn test_schedule_inside_minimum_lead_is_refused() {
    let (cluster, _sims, clock, epochs) = armed_cluster().await;
    let target = ScheduleTarget::At(clock.now() + Duration::from_millis(500));

    let result = schedule_action(&cluster, &clock, &epochs, target, &schedule_settings()).await;

    assert!(matches!(result, Err(SyncError::ScheduleInPast { .. })));
}

#[tokio::test]
async fn test_board_that_misses_load_reports_overshoot() {
    // Arrange
    let (cluster, sims, clock, epochs) = armed_cluster().await;
    inject(&sims[2], SimulatedFaults {
        miss_load: true,
        ..Default::default()
    });

    // Act
    let report = schedule_action(&cluster, &clock, &epochs, ScheduleTarget::Asap, &schedule_settings())
        .await
        .unwrap();

    // Assert
    assert_eq!(report.failed(), vec![BoardId("sim2:7147".into())]);
    assert_eq!(
        report.boards[2].verdict,
        LoadVerdict::MissedDeadline { overshoot_ms: 200.0 }
    );
    for n in [0, 1, 3] {
        assert_eq!(report.boards[n].verdict, LoadVerdict::Committed);
    }
}

#[tokio::test]
async fn test_board_held_in_reset_did_not_arm() {
    let (cluster, sims, clock, epochs) = armed_cluster().await;
    inject(&sims[1], SimulatedFaults {
        held_in_reset: true,
        ..Default::default()
    });

    let report = schedule_action(&cluster, &clock, &epochs, ScheduleTarget::Asap, &schedule_settings())
        .await
        .unwrap();

    assert_eq!(report.boards[1].verdict, LoadVerdict::DidNotArm);
    assert_eq!(report.failed().len(), 1);
}

#[tokio::test]
async fn test_disagreeing_counters_are_reset_first() {
    // Arrange: board 0 still has a pending load from an earlier schedule.
    let stale = Arc::new(SimulatedBoard::new(BoardId("stale".into())).with_counters(5, 4));
    let fresh = Arc::new(SimulatedBoard::new(BoardId("fresh".into())).with_counters(2, 2));
    let cluster = Cluster::new(
        [&stale, &fresh]
            .iter()
            .map(|s| Board {
                id: s.id().clone(),
                role: BoardRole::FEngine,
                bus: Arc::clone(s) as _,
            })
            .collect(),
    );
    let clock = ManualClock::new(Timestamp::from_millis(100_520));
    let epochs = EpochCell::new();
    arm(&cluster, &clock, &epochs, &arm_settings()).await.unwrap();

    // Act
    let report = schedule_action(&cluster, &clock, &epochs, ScheduleTarget::Asap, &schedule_settings())
        .await
        .unwrap();

    // Assert
    assert!(report.reset_issued);
    assert!(report.all_committed());
    assert_eq!(report.boards[0].before, LoadCounters::default());
    assert_eq!(stale.counters(), (1, 1));
    assert_eq!(fresh.counters(), (1, 1));
}

#[tokio::test]
async fn test_reset_that_does_not_take_fails_schedule() {
    let (cluster, sims, clock, epochs) = armed_cluster().await;
    inject(&sims[3], SimulatedFaults {
        ignore_reset: true,
        miss_load: true,
        ..Default::default()
    });
    // One load on the faulty board leaves its counters at (1, 0).
    schedule_action(&cluster, &clock, &epochs, ScheduleTarget::Asap, &schedule_settings())
        .await
        .unwrap();

    let result = schedule_action(&cluster, &clock, &epochs, ScheduleTarget::Asap, &schedule_settings()).await;

    match result {
        Err(SyncError::CounterResetFailed { boards }) => {
            assert_eq!(boards, vec![BoardId("sim3:7147".into())]);
        }
        other => panic!("expected CounterResetFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_schedule_before_any_arm_has_no_epoch() {
    let (cluster, _sims) = simulated_cluster(2);
    let clock = ManualClock::new(Timestamp::from_secs(10));

    let result = schedule_action(
        &cluster,
        &clock,
        &EpochCell::new(),
        ScheduleTarget::Asap,
        &schedule_settings(),
    )
    .await;

    assert!(matches!(result, Err(SyncError::NoEpoch)));
}
