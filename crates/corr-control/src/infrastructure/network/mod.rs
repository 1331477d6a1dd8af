//! Network infrastructure: TCP control connections to boards.
//!
//! # Sub-modules
//!
//! - **`connection`** – One board's connection: the writer and reader tasks
//!   around a [`RequestTracker`](crate::application::request_tracker::RequestTracker),
//!   and the [`RegisterBus`] implementation over `?wordread` / `?wordwrite`.

pub mod connection;

use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;

use crate::application::cluster::{Board, BoardId, Cluster};
use crate::application::registers::RegisterBus;
use crate::application::request_tracker::RpcError;
use crate::infrastructure::storage::config::CorrConfig;

pub use connection::{BoardConnection, ConnectionSettings};

#[derive(Debug, Error)]
#[error("could not connect to board {board}: {source}")]
pub struct ConnectError {
    pub board: BoardId,
    #[source]
    pub source: RpcError,
}

impl ConnectionSettings {
    pub fn from_config(config: &CorrConfig) -> Self {
        Self {
            connect_timeout: config.control.connect_timeout(),
            request_timeout: config.control.request_timeout(),
            capacity: config.control.max_outstanding,
        }
    }
}

/// Connects to every board listed in `config`, concurrently.
///
/// # Errors
///
/// The first board, in config order, that could not be reached.  Boards
/// already connected are dropped, closing their connections.
pub async fn connect_cluster(config: &CorrConfig) -> Result<Cluster, ConnectError> {
    let settings = ConnectionSettings::from_config(config);
    let attempts = join_all(config.boards.iter().map(|entry| async move {
        let address = entry.address();
        BoardConnection::connect(entry.id(), &address, settings).await
    }))
    .await;

    let mut boards = Vec::with_capacity(attempts.len());
    for (entry, attempt) in config.boards.iter().zip(attempts) {
        let connection = attempt.map_err(|source| ConnectError {
            board: entry.id(),
            source,
        })?;
        boards.push(Board {
            id: entry.id(),
            role: entry.role,
            bus: Arc::new(connection) as Arc<dyn RegisterBus>,
        });
    }
    Ok(Cluster::new(boards))
}
