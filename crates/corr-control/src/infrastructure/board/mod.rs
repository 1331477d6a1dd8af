//! Board stand-ins that need no hardware.
//!
//! - **`simulated`** – An in-memory board with the firmware's edge-triggered
//!   register behaviour and injectable faults.

pub mod simulated;

pub use simulated::{simulated_cluster, SimulatedBoard, SimulatedFaults};
