//! Register layouts of the correlator board firmware.
//!
//! Only the registers driven by the synchronisation protocols are listed.
//! Each table is checked at compile time by a `const` assertion.

use crate::register::layout::{FieldSpec, RegisterLayout};

/// Timing-reference control.  Pulsing `arm` makes the board wait for the
/// next one-pulse-per-second edge and reset its sample counter on it.
pub static SYNC_CTRL: RegisterLayout = RegisterLayout::new(
    "sync_ctrl",
    &[
        FieldSpec::flag("arm", 0),
        FieldSpec::flag("manual_trigger", 1),
        FieldSpec::flag("reset_error_count", 2),
        FieldSpec::unsigned("reserved", 3, 29),
    ],
);

/// Timing-reference status.  `waiting` stays set between an arm and the
/// pulse edge that consumes it; `pulse_count` counts edges seen since then.
pub static SYNC_STATUS: RegisterLayout = RegisterLayout::new(
    "sync_status",
    &[
        FieldSpec::unsigned("pulse_count", 0, 28),
        FieldSpec::flag("waiting", 28),
        FieldSpec::unsigned("error_count", 29, 3),
    ],
);

/// Vector accumulator control.
pub static VACC_CTRL: RegisterLayout = RegisterLayout::new(
    "vacc_ctrl",
    &[
        FieldSpec::flag("reset", 0),
        FieldSpec::enumerated("mode", 1, 2, &["continuous", "single", "hold"]),
        FieldSpec::unsigned("reserved", 3, 29),
    ],
);

/// High word of the scheduled load time.  A rising edge on `commit` latches
/// the full 63-bit target and increments the accumulator arm count.
pub static VACC_LOAD_MSB: RegisterLayout = RegisterLayout::new(
    "vacc_load_msb",
    &[
        FieldSpec::unsigned("time_msb", 0, 31),
        FieldSpec::flag("commit", 31),
    ],
);

/// Low word of the scheduled load time.
pub static VACC_LOAD_LSB: RegisterLayout =
    RegisterLayout::new("vacc_load_lsb", &[FieldSpec::unsigned("time_lsb", 0, 32)]);

/// Accumulator status counters.  `arm_count` increments when a schedule is
/// accepted, `load_count` when the board actually restarts the accumulator.
pub static VACC_STATUS: RegisterLayout = RegisterLayout::new(
    "vacc_status",
    &[
        FieldSpec::unsigned("arm_count", 0, 16),
        FieldSpec::unsigned("load_count", 16, 16),
    ],
);

const _: () = assert!(SYNC_CTRL.is_well_formed());
const _: () = assert!(SYNC_STATUS.is_well_formed());
const _: () = assert!(VACC_CTRL.is_well_formed());
const _: () = assert!(VACC_LOAD_MSB.is_well_formed());
const _: () = assert!(VACC_LOAD_LSB.is_well_formed());
const _: () = assert!(VACC_STATUS.is_well_formed());

/// Number of bits in a scheduled load time (31 high + 32 low).
pub const LOAD_TIME_BITS: u32 = 63;

/// Width of the arm/load counters in `vacc_status`.
pub const VACC_COUNTER_BITS: u32 = 16;

/// Every layout in the catalogue, for lookup by register name.
pub static ALL: [&RegisterLayout; 6] = [
    &SYNC_CTRL,
    &SYNC_STATUS,
    &VACC_CTRL,
    &VACC_LOAD_MSB,
    &VACC_LOAD_LSB,
    &VACC_STATUS,
];

/// Finds a catalogue layout by register name.
pub fn by_name(register: &str) -> Option<&'static RegisterLayout> {
    ALL.iter().copied().find(|l| l.register == register)
}

/// Splits a load-time counter value into `(high, low)` words, or `None` if it
/// does not fit in [`LOAD_TIME_BITS`].
pub fn split_load_time(target: u64) -> Option<(u32, u32)> {
    if target >> LOAD_TIME_BITS != 0 {
        return None;
    }
    Some(((target >> 32) as u32, target as u32))
}

/// Joins `(high, low)` words back into a load-time counter value.
pub fn join_load_time(high: u32, low: u32) -> u64 {
    (u64::from(high & 0x7FFF_FFFF) << 32) | u64::from(low)
}
