#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

//! Append-only, tile-addressed Merkle log storage engine.
//!
//! See the module list below for the four subsystems from the design:
//! [`layout`]/[`hash`] (pure math), [`queue`] (ingestion & dedup),
//! [`sequencer`] (index assignment), [`integrator`] (tile/checkpoint
//! writer), and [`migration`] (log-to-log copier). [`facade`] wires them
//! into the single entry point the [`server`] module exposes over HTTP.

pub mod bundle;
pub mod checkpoint;
pub mod config;
pub mod facade;
pub mod hash;
pub mod integrator;
pub mod layout;
pub mod migration;
pub mod queue;
pub mod sequencer;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod utils;

use std::net::TcpListener;
use std::sync::Arc;

use tracing::info;

use crate::checkpoint::Signer;
use crate::config::Config;
use crate::storage::memory::MemoryStorage;
use crate::storage::Storage;

/// Crate entry point used by the `tlog-tiles` binary. Wires a storage
/// backend, a queue/sequencer pair and the HTTP facade together and runs
/// until a shutdown signal arrives.
///
/// The only concrete [`Storage`] shipped here is [`MemoryStorage`] — a
/// durable backend (object store, SQL, filesystem) is explicitly out of
/// scope for this crate and is left to the embedder.
///
/// # Errors
/// Returns an error if the configured address cannot be bound or if the
/// HTTP server exits with an error.
pub async fn main(config: Config, signers: Vec<Arc<dyn Signer>>) -> anyhow::Result<()> {
    info!(origin = %config.tree.origin, "starting log");
    shutdown::watch_shutdown_signals();

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let facade = Arc::new(facade::Facade::spawn(
        config.tree.origin.clone(),
        config.queue.clone(),
        storage,
        signers,
    ));

    let listener = TcpListener::bind(config.server.address)?;
    server::run(facade, listener).await
}
