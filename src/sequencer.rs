//! Assigns contiguous leaf indices to a batch and drives the integrator
//! under the single-writer discipline.
//!
//! There is no separate counter to persist: the "next free index" is
//! always `state.size`, read from the same CAS'd state record the
//! integrator publishes, so assignment and integration advance as one
//! atomic unit.

use thiserror::Error;

use crate::checkpoint::Signer;
use crate::integrator::{Integrator, IntegratorError};
use crate::storage::{ErrorKind, Storage, StorageError, TreeState};

#[derive(Debug, Clone, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Integrator(#[from] IntegratorError),
}

impl SequencerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Integrator(e) => e.kind(),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientStorage)
    }
}

/// The result of successfully sequencing a batch: the index assigned to
/// its first entry, and the resulting tree state.
#[derive(Debug, Clone)]
pub struct Assigned {
    pub start_index: u64,
    pub state: TreeState,
}

#[derive(Clone)]
pub struct Sequencer {
    integrator: Integrator,
}

impl Sequencer {
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            integrator: Integrator::new(origin),
        }
    }

    /// Reads the current state, assigns `entries` the next contiguous
    /// range of indices, and integrates them. A single call owns the
    /// entire read-assign-integrate-publish transaction, which is what
    /// makes it safe to run many sequencers against the same storage: the
    /// loser of a concurrent race gets [`StorageError::CasConflict`] back
    /// and should reload state and retry the whole batch.
    ///
    /// # Errors
    /// Returns [`SequencerError`] on any storage or integration failure;
    /// callers should inspect `.kind()` to decide whether to retry.
    pub async fn assign_batch(
        &self,
        storage: &dyn Storage,
        entries: &[Vec<u8>],
        signers: &[&dyn Signer],
    ) -> Result<Assigned, SequencerError> {
        let prev = storage.get_state().await.map_err(IntegratorError::Storage)?;
        let start_index = prev.as_ref().map_or(0, |s| s.size);

        let state = self
            .integrator
            .integrate(storage, prev.as_ref(), entries, signers)
            .await?;

        Ok(Assigned { start_index, state })
    }
}
