//! In-memory board that behaves like the correlator firmware's sync and
//! accumulator registers.
//!
//! It answers the same register reads and writes a real board does, reacts to
//! the rising edges the protocols rely on, and can be told to misbehave in
//! the ways real boards do.  `corr-ctl --simulate` and the integration tests
//! drive it.
//!
//! | Register        | Reaction                                                  |
//! |-----------------|-----------------------------------------------------------|
//! | `sync_ctrl`     | `arm` rising: set `waiting` until the next PPS edge        |
//! | `sync_status`   | read-only; a read may deliver the pending PPS edge         |
//! | `vacc_ctrl`     | `reset` rising: zero `arm_count` and `load_count`          |
//! | `vacc_load_msb` | `commit` rising: latch the load time, count arm and load   |
//! | `vacc_status`   | read-only counters                                         |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use corr_core::register::catalog::{
    self, join_load_time, SYNC_CTRL, SYNC_STATUS, VACC_CTRL, VACC_LOAD_MSB, VACC_STATUS,
};
use corr_core::register::RegisterLayout;
use tracing::trace;

use crate::application::cluster::{Board, BoardId, BoardRole, Cluster};
use crate::application::registers::RegisterBus;
use crate::application::request_tracker::RpcError;

const COUNTER_MASK: u32 = 0xFFFF;

/// Ways a simulated board can misbehave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedFaults {
    /// Every request fails with [`RpcError::ConnectionLost`].
    pub unreachable: bool,
    /// The PPS edge never arrives, so `waiting` never clears.
    pub no_pps: bool,
    /// Commit edges are ignored: nothing is latched or counted.
    pub held_in_reset: bool,
    /// Load times are latched but the load never happens.
    pub miss_load: bool,
    /// Accumulator resets are ignored.
    pub ignore_reset: bool,
}

#[derive(Debug, Default)]
struct BoardState {
    words: HashMap<String, u32>,
    waiting: bool,
    polls_until_pps: u32,
    pulse_count: u32,
    arm_count: u32,
    load_count: u32,
    latched: Option<u64>,
    writes: Vec<(String, u32)>,
    faults: SimulatedFaults,
}

/// A simulated correlator board.
#[derive(Debug)]
pub struct SimulatedBoard {
    id: BoardId,
    /// `sync_status` reads that still show `waiting` after an arm.
    pps_delay_polls: u32,
    state: Mutex<BoardState>,
}

impl SimulatedBoard {
    pub fn new(id: BoardId) -> Self {
        Self {
            id,
            pps_delay_polls: 0,
            state: Mutex::new(BoardState::default()),
        }
    }

    /// Keeps `waiting` set for `polls` status reads after each arm.
    pub fn with_pps_delay(mut self, polls: u32) -> Self {
        self.pps_delay_polls = polls;
        self
    }

    /// Starts with the given accumulator counters.
    pub fn with_counters(self, arm_count: u32, load_count: u32) -> Self {
        {
            let mut state = self.lock();
            state.arm_count = arm_count & COUNTER_MASK;
            state.load_count = load_count & COUNTER_MASK;
        }
        self
    }

    pub fn with_faults(self, faults: SimulatedFaults) -> Self {
        self.set_faults(faults);
        self
    }

    pub fn id(&self) -> &BoardId {
        &self.id
    }

    pub fn set_faults(&self, faults: SimulatedFaults) {
        self.lock().faults = faults;
    }

    /// Every register write received, in order.
    pub fn writes(&self) -> Vec<(String, u32)> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// The most recently latched load time.
    pub fn latched_load_time(&self) -> Option<u64> {
        self.lock().latched
    }

    /// `(arm_count, load_count)`.
    pub fn counters(&self) -> (u32, u32) {
        let state = self.lock();
        (state.arm_count, state.load_count)
    }

    /// Number of PPS edges delivered since the last arm.
    pub fn pulse_count(&self) -> u32 {
        self.lock().pulse_count
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rejected(register: &str, why: &str) -> RpcError {
        RpcError::RemoteError {
            name: "wordwrite".to_string(),
            message: format!("{register}: {why}"),
        }
    }
}

fn field(layout: &RegisterLayout, name: &str, word: u32) -> u32 {
    layout.field(name).map_or(0, |(_, spec)| spec.extract(word))
}

fn rising(layout: &RegisterLayout, name: &str, before: u32, after: u32) -> bool {
    field(layout, name, before) == 0 && field(layout, name, after) != 0
}

fn with_field(layout: &RegisterLayout, name: &str, word: u32, value: u32) -> u32 {
    layout
        .field(name)
        .map_or(word, |(_, spec)| spec.insert(word, value))
}

#[async_trait]
impl RegisterBus for SimulatedBoard {
    async fn read_register(&self, register: &str) -> Result<u32, RpcError> {
        let mut state = self.lock();
        if state.faults.unreachable {
            return Err(RpcError::ConnectionLost);
        }
        let word = match register {
            "sync_status" => {
                if state.waiting && !state.faults.no_pps {
                    if state.polls_until_pps == 0 {
                        state.waiting = false;
                        state.pulse_count += 1;
                    } else {
                        state.polls_until_pps -= 1;
                    }
                }
                let word = with_field(&SYNC_STATUS, "pulse_count", 0, state.pulse_count);
                with_field(&SYNC_STATUS, "waiting", word, u32::from(state.waiting))
            }
            "vacc_status" => {
                let word = with_field(&VACC_STATUS, "arm_count", 0, state.arm_count);
                with_field(&VACC_STATUS, "load_count", word, state.load_count)
            }
            other => match state.words.get(other) {
                Some(word) => *word,
                None if catalog::by_name(other).is_some() => 0,
                None => {
                    return Err(RpcError::RemoteError {
                        name: "wordread".to_string(),
                        message: format!("{other}: no such register"),
                    })
                }
            },
        };
        trace!(board = %self.id, register, word, "Simulated read");
        Ok(word)
    }

    async fn write_register(&self, register: &str, value: u32) -> Result<(), RpcError> {
        let mut state = self.lock();
        if state.faults.unreachable {
            return Err(RpcError::ConnectionLost);
        }
        if register == SYNC_STATUS.register || register == VACC_STATUS.register {
            return Err(Self::rejected(register, "read-only register"));
        }
        state.writes.push((register.to_string(), value));
        let before = state
            .words
            .insert(register.to_string(), value)
            .unwrap_or(0);

        match register {
            "sync_ctrl" if rising(&SYNC_CTRL, "arm", before, value) => {
                state.waiting = true;
                state.polls_until_pps = self.pps_delay_polls;
                state.pulse_count = 0;
            }
            "vacc_ctrl" if rising(&VACC_CTRL, "reset", before, value) => {
                if !state.faults.ignore_reset {
                    state.arm_count = 0;
                    state.load_count = 0;
                }
            }
            "vacc_load_msb" if rising(&VACC_LOAD_MSB, "commit", before, value) => {
                if !state.faults.held_in_reset {
                    let low = state.words.get("vacc_load_lsb").copied().unwrap_or(0);
                    state.latched = Some(join_load_time(field(&VACC_LOAD_MSB, "time_msb", value), low));
                    state.arm_count = (state.arm_count + 1) & COUNTER_MASK;
                    if !state.faults.miss_load {
                        state.load_count = (state.load_count + 1) & COUNTER_MASK;
                    }
                }
            }
            _ => {}
        }
        trace!(board = %self.id, register, value, "Simulated write");
        Ok(())
    }

    async fn ping(&self) -> bool {
        !self.lock().faults.unreachable
    }
}

/// Builds a cluster of `count` healthy simulated boards named `sim<N>:7147`.
/// Even-numbered boards are F-engines, odd ones X-engines.
pub fn simulated_cluster(count: usize) -> (Cluster, Vec<Arc<SimulatedBoard>>) {
    let sims: Vec<Arc<SimulatedBoard>> = (0..count)
        .map(|n| Arc::new(SimulatedBoard::new(BoardId(format!("sim{n}:7147")))))
        .collect();
    let boards = sims
        .iter()
        .enumerate()
        .map(|(n, sim)| Board {
            id: sim.id().clone(),
            role: if n % 2 == 0 {
                BoardRole::FEngine
            } else {
                BoardRole::XEngine
            },
            bus: Arc::clone(sim) as Arc<dyn RegisterBus>,
        })
        .collect();
    (Cluster::new(boards), sims)
}
