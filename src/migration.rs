//! Migration copier.
//!
//! Pulls entry bundles from a source log into a local [`Storage`] and
//! blocks until the locally recomputed root matches the source root.
//! Worker concurrency uses a bounded-concurrency stream instead of a
//! hand-rolled channel + worker pool, since
//! `futures::stream::StreamExt::buffer_unordered` already gives us
//! exactly "`numWorkers` workers pull bundle addresses".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::checkpoint::Signer;
use crate::hash::Hash;
use crate::integrator::{Integrator, IntegratorError};
use crate::layout::{self, BundleAddress};
use crate::storage::{ErrorKind, Storage, StorageError};

/// Bounded exponential-backoff retry budget for each fetch+store.
const MAX_ATTEMPTS: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("local log is ahead of the source: target size {target} > source size {source}")]
    TargetAheadOfSource { target: u64, source: u64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Integrator(#[from] IntegratorError),
    #[error("source fetch failed: {0}")]
    Source(String),
    #[error(
        "root mismatch after migration: local {local:?} != source {source:?} at size {size}"
    )]
    RootMismatch {
        local: Hash,
        source: Hash,
        size: u64,
    },
}

impl MigrationError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(e) if e.kind() == ErrorKind::TransientStorage
        ) || matches!(self, Self::Source(_))
    }
}

/// Remote collaborator the copier pulls entry bundles from. The
/// concrete transport (HTTP GET against `/tile/entries/...`) is an
/// external collaborator; this trait is the seam.
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn get_bundle(&self, bundle_index: u64, partial: u64) -> Result<Vec<u8>, MigrationError>;
}

/// Copies bundles `[target_size, source_size)` from `source` into
/// `storage`, then finalizes tiles/checkpoint and verifies the root.
///
/// # Errors
/// Returns [`MigrationError::TargetAheadOfSource`] if local storage is
/// already ahead of the source, propagates any storage/source error
/// after exhausting retries, and returns
/// [`MigrationError::RootMismatch`] (fatal, non-retryable) if the
/// recomputed root disagrees with `source_root`.
#[instrument(level = "info", skip(source, storage, signers))]
pub async fn migrate(
    num_workers: usize,
    source_size: u64,
    source_root: Hash,
    origin: impl Into<String> + Send,
    source: Arc<dyn BundleSource>,
    storage: Arc<dyn Storage>,
    signers: &[&dyn Signer],
) -> Result<(), MigrationError> {
    let prev = storage.get_state().await?;
    let target_size = prev.as_ref().map_or(0, |s| s.size);
    if target_size > source_size {
        return Err(MigrationError::TargetAheadOfSource {
            target: target_size,
            source: source_size,
        });
    }

    let addresses = layout::bundles_for_range(target_size, source_size);
    info!(count = addresses.len(), "copying entry bundles");

    let results: Vec<Result<(), MigrationError>> = stream::iter(addresses)
        .map(|addr: BundleAddress| {
            let source = Arc::clone(&source);
            let storage = Arc::clone(&storage);
            async move { copy_bundle_with_retry(addr, source_size, source.as_ref(), storage.as_ref()).await }
        })
        .buffer_unordered(num_workers.max(1))
        .collect()
        .await;

    for result in results {
        result?;
    }

    let integrator = Integrator::new(origin);
    let root = integrator
        .recompute_root_from_bundles(storage.as_ref(), prev.as_ref(), source_size)
        .await?;

    if root != source_root {
        // Tiles were written but no checkpoint was published: the
        // mismatch is fatal and non-retryable, and local state
        // invariants (size, root_hash) are untouched.
        return Err(MigrationError::RootMismatch {
            local: root,
            source: source_root,
            size: source_size,
        });
    }

    integrator
        .publish(storage.as_ref(), prev.as_ref(), source_size, root, signers)
        .await?;

    info!(size = source_size, "migration complete, root verified");
    Ok(())
}

async fn copy_bundle_with_retry(
    addr: BundleAddress,
    source_size: u64,
    source: &dyn BundleSource,
    storage: &dyn Storage,
) -> Result<(), MigrationError> {
    let partial = layout::bundle_partial_size(addr.bundle_index, source_size);
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result: Result<(), MigrationError> = async {
            let bytes = source.get_bundle(addr.bundle_index, partial).await?;
            storage
                .put_bundle(addr.bundle_index, partial, bytes)
                .await
                .map_err(MigrationError::from)
        }
        .await;

        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt < MAX_ATTEMPTS && err.is_retryable() => {
                warn!(
                    bundle_index = addr.bundle_index,
                    attempt, error = %err, "retrying bundle copy"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}
