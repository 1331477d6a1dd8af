//! Register access: the bus port and the read / write / pulse operations
//! built on it.
//!
//! Every write is a read-modify-write of the whole 32-bit word through a
//! [`RegisterSnapshot`], so fields the caller does not name keep the value
//! the board reported.  Nothing here is atomic across boards.

use async_trait::async_trait;
use corr_core::register::{decode, FieldValue, LayoutError, RegisterLayout, RegisterSnapshot};
use futures_util::future::join_all;
use thiserror::Error;
use tracing::debug;

use crate::application::request_tracker::RpcError;

/// Errors from a register operation.
#[derive(Debug, Error, Clone)]
pub enum RegisterAccessError {
    #[error("register {register}: {source}")]
    Rpc {
        register: &'static str,
        #[source]
        source: RpcError,
    },

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Synchronous-style register primitives of one board.
///
/// The TCP connection implements this over the request tracker; the
/// simulated board implements it in memory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Reads the raw 32-bit word of `register`.
    async fn read_register(&self, register: &str) -> Result<u32, RpcError>;

    /// Writes the raw 32-bit word of `register`.
    async fn write_register(&self, register: &str, value: u32) -> Result<(), RpcError>;

    /// Returns `true` if the board answers a watchdog request.
    async fn ping(&self) -> bool;
}

/// Reads `layout.register` and decodes it.
///
/// # Errors
///
/// RPC failure of the read, or a malformed layout.
pub async fn read(
    bus: &dyn RegisterBus,
    layout: &'static RegisterLayout,
) -> Result<RegisterSnapshot, RegisterAccessError> {
    let raw = bus
        .read_register(layout.register)
        .await
        .map_err(|source| RegisterAccessError::Rpc {
            register: layout.register,
            source,
        })?;
    Ok(decode(layout, raw)?)
}

/// Writes `snapshot` as a whole word without reading first.
///
/// # Errors
///
/// RPC failure of the write.
pub async fn store(
    bus: &dyn RegisterBus,
    snapshot: &RegisterSnapshot,
) -> Result<(), RegisterAccessError> {
    let register = snapshot.layout().register;
    let raw = snapshot.encode();
    debug!(register, value = %format_args!("{raw:#010x}"), "Register write");
    bus.write_register(register, raw)
        .await
        .map_err(|source| RegisterAccessError::Rpc { register, source })
}

/// Read-modify-write: applies `updates` to the current value and writes the
/// whole word back.  Returns the snapshot that was written.
///
/// Updates are validated before anything is written.
///
/// # Errors
///
/// RPC failure, an unknown field, a kind mismatch or a value too wide.
pub async fn write(
    bus: &dyn RegisterBus,
    layout: &'static RegisterLayout,
    updates: &[(&str, FieldValue)],
) -> Result<RegisterSnapshot, RegisterAccessError> {
    let mut snapshot = read(bus, layout).await?;
    snapshot.apply(updates)?;
    store(bus, &snapshot).await?;
    Ok(snapshot)
}

/// Drives each named flag low, high, then low again with three writes of the
/// whole word, triggering the hardware's edge-sensitive action.
///
/// The word is read once; every write carries the other fields at their
/// read values.  The pulse width is the latency of the writes.
///
/// # Errors
///
/// RPC failure, or a named field that is not a flag of `layout`.
pub async fn pulse(
    bus: &dyn RegisterBus,
    layout: &'static RegisterLayout,
    fields: &[&str],
) -> Result<(), RegisterAccessError> {
    let mut snapshot = read(bus, layout).await?;
    for level in [false, true, false] {
        let updates: Vec<(&str, FieldValue)> = fields
            .iter()
            .map(|name| (*name, FieldValue::Flag(level)))
            .collect();
        snapshot.apply(&updates)?;
        store(bus, &snapshot).await?;
    }
    Ok(())
}

/// Runs [`write`] against every bus concurrently and returns one result per
/// bus, in input order.  No ordering between boards is implied.
pub async fn write_many(
    buses: &[&dyn RegisterBus],
    layout: &'static RegisterLayout,
    updates: &[(&str, FieldValue)],
) -> Vec<Result<RegisterSnapshot, RegisterAccessError>> {
    join_all(buses.iter().map(|bus| write(*bus, layout, updates))).await
}

/// Runs [`pulse`] against every bus concurrently; one result per bus.
pub async fn pulse_many(
    buses: &[&dyn RegisterBus],
    layout: &'static RegisterLayout,
    fields: &[&str],
) -> Vec<Result<(), RegisterAccessError>> {
    join_all(buses.iter().map(|bus| pulse(*bus, layout, fields))).await
}

/// Runs [`read`] against every bus concurrently; one result per bus.
pub async fn read_many(
    buses: &[&dyn RegisterBus],
    layout: &'static RegisterLayout,
) -> Vec<Result<RegisterSnapshot, RegisterAccessError>> {
    join_all(buses.iter().map(|bus| read(*bus, layout))).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use corr_core::register::catalog::{SYNC_CTRL, VACC_CTRL};
    use mockall::predicate::{always, eq};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_read_decodes_board_word() {
        // Arrange
        let mut bus = MockRegisterBus::new();
        bus.expect_read_register()
            .with(eq("vacc_ctrl"))
            .returning(|_| Ok(0b011));

        // Act
        let snapshot = read(&bus, &VACC_CTRL).await.unwrap();

        // Assert
        assert!(snapshot.flag("reset").unwrap());
        assert_eq!(snapshot.label("mode").unwrap(), Some("single"));
    }

    #[tokio::test]
    async fn test_write_preserves_unnamed_fields() {
        // Arrange: reserved bits set on the board must survive.
        let mut bus = MockRegisterBus::new();
        bus.expect_read_register().returning(|_| Ok(0xFFFF_FFF8));
        bus.expect_write_register()
            .with(eq("vacc_ctrl"), eq(0xFFFF_FFF8 & !0b110 | 0b100))
            .times(1)
            .returning(|_, _| Ok(()));

        // Act
        let written = write(&bus, &VACC_CTRL, &[("mode", FieldValue::Enumerated(2))])
            .await
            .unwrap();

        // Assert
        assert_eq!(written.label("mode").unwrap(), Some("hold"));
    }

    #[tokio::test]
    async fn test_write_with_unknown_field_issues_no_write() {
        let mut bus = MockRegisterBus::new();
        bus.expect_read_register().returning(|_| Ok(0));
        bus.expect_write_register().never();

        let result = write(&bus, &VACC_CTRL, &[("speed", true.into())]).await;

        assert!(matches!(
            result,
            Err(RegisterAccessError::Layout(LayoutError::UnknownField { .. }))
        ));
    }

    #[tokio::test]
    async fn test_pulse_writes_low_high_low_in_order() {
        // Arrange: manual_trigger is already set and must stay set.
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MockRegisterBus::new();
        bus.expect_read_register().times(1).returning(|_| Ok(0b010));
        let log = Arc::clone(&written);
        bus.expect_write_register()
            .with(eq("sync_ctrl"), always())
            .times(3)
            .returning(move |_, value| {
                log.lock().unwrap().push(value);
                Ok(())
            });

        // Act
        pulse(&bus, &SYNC_CTRL, &["arm"]).await.unwrap();

        // Assert
        assert_eq!(*written.lock().unwrap(), vec![0b010, 0b011, 0b010]);
    }

    #[tokio::test]
    async fn test_failed_read_names_the_register() {
        let mut bus = MockRegisterBus::new();
        bus.expect_read_register()
            .returning(|_| Err(RpcError::Timeout));

        let result = read(&bus, &SYNC_CTRL).await;

        match result {
            Err(RegisterAccessError::Rpc { register, source }) => {
                assert_eq!(register, "sync_ctrl");
                assert!(matches!(source, RpcError::Timeout));
            }
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_many_reports_each_board() {
        let mut good = MockRegisterBus::new();
        good.expect_read_register().returning(|_| Ok(0));
        good.expect_write_register().returning(|_, _| Ok(()));
        let mut bad = MockRegisterBus::new();
        bad.expect_read_register()
            .returning(|_| Err(RpcError::ConnectionLost));

        let buses: [&dyn RegisterBus; 2] = [&good, &bad];
        let results = write_many(&buses, &VACC_CTRL, &[("reset", true.into())]).await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
