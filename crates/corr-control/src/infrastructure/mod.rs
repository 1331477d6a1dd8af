//! Infrastructure layer for the control plane.
//!
//! Contains the OS-facing adapters: TCP board connections, the simulated
//! board, the system clock and configuration file storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `corr_core`, but MUST NOT be imported by the `application` layer.

pub mod board;
pub mod clock;
pub mod network;
pub mod storage;
