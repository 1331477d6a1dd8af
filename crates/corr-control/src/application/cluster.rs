//! The cluster of boards driven by the synchronisation protocols, and the
//! errors those protocols report.

use std::fmt;
use std::sync::Arc;

use corr_core::timing::{Timestamp, TimingError};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::registers::{RegisterAccessError, RegisterBus};

/// Identity of a board, conventionally `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardId(pub String);

impl BoardId {
    pub fn from_endpoint(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// The part a board plays in the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoardRole {
    /// Channelises antenna samples.
    FEngine,
    /// Cross-multiplies and accumulates.
    XEngine,
}

impl fmt::Display for BoardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoardRole::FEngine => "f-engine",
            BoardRole::XEngine => "x-engine",
        })
    }
}

/// One board: its identity, role and register bus.
#[derive(Clone)]
pub struct Board {
    pub id: BoardId,
    pub role: BoardRole,
    pub bus: Arc<dyn RegisterBus>,
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// An ordered set of boards.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    boards: Vec<Board>,
}

impl Cluster {
    pub fn new(boards: Vec<Board>) -> Self {
        Self { boards }
    }

    pub fn boards(&self) -> &[Board] {
        &self.boards
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    pub fn ids(&self) -> Vec<BoardId> {
        self.boards.iter().map(|b| b.id.clone()).collect()
    }

    pub fn buses(&self) -> Vec<&dyn RegisterBus> {
        self.boards.iter().map(|b| b.bus.as_ref()).collect()
    }

    /// The boards whose ids are listed, in cluster order.  Used to retry a
    /// protocol against only the boards that failed.
    pub fn subset(&self, ids: &[BoardId]) -> Cluster {
        Cluster::new(
            self.boards
                .iter()
                .filter(|b| ids.contains(&b.id))
                .cloned()
                .collect(),
        )
    }

    pub fn with_role(&self, role: BoardRole) -> Cluster {
        Cluster::new(self.boards.iter().filter(|b| b.role == role).cloned().collect())
    }

    /// Pings every board concurrently.
    pub async fn ping_all(&self) -> Vec<(BoardId, bool)> {
        let replies = join_all(self.boards.iter().map(|b| b.bus.ping())).await;
        self.ids().into_iter().zip(replies).collect()
    }
}

/// Errors that abort an arm or schedule attempt.
///
/// Every variant that concerns particular boards names them, so a caller can
/// retry against [`Cluster::subset`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cluster has no boards")]
    EmptyCluster,

    #[error("arm failed on {}", join_ids(.failed))]
    PartialArmFailure {
        failed: Vec<BoardId>,
        report: Box<crate::application::arm::ArmReport>,
    },

    #[error("target {target} is before the earliest safe time {earliest}")]
    ScheduleInPast {
        target: Timestamp,
        earliest: Timestamp,
    },

    #[error("no epoch has been established; arm the cluster first")]
    NoEpoch,

    #[error("load counter {0} does not fit the load-time registers")]
    TargetOutOfRange(u64),

    #[error("accumulator counters did not reset on {}", join_ids(.boards))]
    CounterResetFailed { boards: Vec<BoardId> },

    #[error("invalid counter geometry: {0}")]
    Timing(#[from] TimingError),

    #[error("board {board}: {source}")]
    Register {
        board: BoardId,
        #[source]
        source: RegisterAccessError,
    },
}

fn join_ids(ids: &[BoardId]) -> String {
    ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", ")
}
