//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads and writes the TOML file that lists the
//! boards of the cluster and tunes timeouts, counter geometry and the
//! synchronisation protocols.  It also converts those settings into the
//! types the application layer takes.

pub mod config;
