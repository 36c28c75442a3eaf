//! Public-facing façade.
//!
//! The single type the HTTP layer (and any other embedder) talks to:
//! `add` goes through the [`Queue`]; the three read operations are
//! strict byte pass-throughs from [`Storage`] and never block on
//! integration.

use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::checkpoint::Signer;
use crate::layout::{BundleAddress, TileAddress};
use crate::queue::{Queue, QueueConfig, QueueError};
use crate::sequencer::Sequencer;
use crate::storage::{ErrorKind, Storage, StorageError};

#[derive(Debug, Clone, Error)]
pub enum FacadeError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FacadeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Queue(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// A checkpoint read together with the `size` it commits to: callers can
/// compare against a previously observed size to detect a checkpoint
/// older than one they've already seen without re-parsing the note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRead {
    pub size: u64,
    pub signed_note: Vec<u8>,
}

/// Wires [`Queue`] (ingestion + dedup + sequencing) to a [`Storage`]
/// backend and exposes four operations: `add`, `read_checkpoint`,
/// `read_tile`, `read_entry_bundle`.
pub struct Facade {
    queue: Arc<Queue>,
    storage: Arc<dyn Storage>,
}

impl Facade {
    /// Starts the queue's background flush worker and returns a façade
    /// bound to it.
    #[must_use]
    pub fn spawn(
        origin: impl Into<String>,
        queue_config: QueueConfig,
        storage: Arc<dyn Storage>,
        signers: Vec<Arc<dyn Signer>>,
    ) -> Self {
        let sequencer = Sequencer::new(origin);
        let queue = Queue::spawn(queue_config, sequencer, Arc::clone(&storage), signers);
        Self { queue, storage }
    }

    /// `Add`: submits `entry` under dedup key `identity`, resolving once
    /// the batch containing it has been integrated.
    ///
    /// # Errors
    /// See [`FacadeError`]; callers should inspect `.kind()` to decide
    /// whether to retry.
    #[instrument(level = "debug", skip(self, entry))]
    pub async fn add(&self, entry: Vec<u8>, identity: Vec<u8>) -> Result<u64, FacadeError> {
        self.queue.add(entry, identity).await.map_err(Into::into)
    }

    /// `ReadCheckpoint`: the latest signed note, or `None` if the log is
    /// empty. Never blocks on integration.
    ///
    /// # Errors
    /// Propagates storage errors verbatim.
    pub async fn read_checkpoint(&self) -> Result<Option<CheckpointRead>, FacadeError> {
        let state = self.storage.get_state().await?;
        Ok(state.map(|s| CheckpointRead {
            size: s.size,
            signed_note: s.signed_note,
        }))
    }

    /// `ReadTile`: tile bytes, or `None` if absent.
    ///
    /// # Errors
    /// Propagates storage errors verbatim.
    pub async fn read_tile(&self, tile: TileAddress, partial: u64) -> Result<Option<Vec<u8>>, FacadeError> {
        self.storage
            .get_tile(tile.tile_level, tile.tile_index, partial)
            .await
            .map_err(Into::into)
    }

    /// `ReadEntryBundle`: bundle bytes, or `None` if absent.
    ///
    /// # Errors
    /// Propagates storage errors verbatim.
    pub async fn read_entry_bundle(
        &self,
        bundle: BundleAddress,
        partial: u64,
    ) -> Result<Option<Vec<u8>>, FacadeError> {
        self.storage
            .get_bundle(bundle.bundle_index, partial)
            .await
            .map_err(Into::into)
    }
}
