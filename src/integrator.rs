//! Tile layout & integration engine.
//!
//! Given a batch of newly sequenced leaves, writes the entry bundles and
//! hash tiles they land in, aggregates completed tiles upward through the
//! 256-ary tile grid, and publishes a new signed checkpoint. Tile/bundle
//! writes always precede the state CAS: on any failure before the CAS,
//! the batch is aborted and the orphaned tile bytes are simply never
//! referenced by a published state.

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::bundle::{self, BundleError};
use crate::checkpoint::{Checkpoint, Signer, SignedNote};
use crate::hash::{self, Hash};
use crate::layout::{self, BundleAddress, TILE_WIDTH};
use crate::storage::{ErrorKind, Storage, StorageError, TreeState};

#[derive(Debug, Clone, Error)]
pub enum IntegratorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl IntegratorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) => e.kind(),
            Self::Bundle(_) => ErrorKind::PermanentStorage,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientStorage)
    }
}

/// Updates tiles/bundles for new leaves and publishes the resulting
/// checkpoint. Holds no mutable state of its own: every call reads
/// whatever a [`Storage`] implementation currently has and leaves it
/// consistent, which is what makes replays idempotent (property 6).
#[derive(Clone)]
pub struct Integrator {
    pub origin: String,
}

impl Integrator {
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self { origin: origin.into() }
    }

    /// Integrates `entries` (already assigned indices `[prev.size,
    /// prev.size + entries.len())` by the sequencer) and publishes a new
    /// checkpoint signed by every signer in `signers`.
    ///
    /// # Errors
    /// Returns [`IntegratorError::Storage`] with
    /// [`StorageError::CasConflict`] if another writer advanced the state
    /// concurrently (retryable by the caller); any other storage or
    /// bundle error aborts without advancing state.
    #[instrument(level = "debug", skip_all, fields(origin = %self.origin))]
    pub async fn integrate(
        &self,
        storage: &dyn Storage,
        prev: Option<&TreeState>,
        entries: &[Vec<u8>],
        signers: &[&dyn Signer],
    ) -> Result<TreeState, IntegratorError> {
        let prev_size = prev.map_or(0, |s| s.size);
        if entries.is_empty() {
            return prev.cloned().ok_or_else(|| {
                IntegratorError::InvariantViolation("cannot integrate empty batch into empty log".into())
            });
        }

        let leaf_hashes: Vec<Hash> = entries.iter().map(|e| hash::leaf_hash(e)).collect();
        write_bundles(storage, prev_size, entries).await?;
        integrate_leaves(storage, prev_size, &leaf_hashes).await?;

        let new_size = prev_size + entries.len() as u64;
        let leaves = collect_leaf_hashes(storage, new_size).await?;
        let root = hash::naive_root(&leaves);

        let checkpoint = Checkpoint {
            origin: self.origin.clone(),
            size: new_size,
            root,
        };
        let note = SignedNote::sign(checkpoint, signers).await;

        let next = TreeState {
            size: new_size,
            root_hash: root,
            signed_note: note.to_bytes(),
            cas_token: prev.map_or(0, |s| s.cas_token) + 1,
        };
        storage
            .put_state(prev.map(|s| s.cas_token), next.clone())
            .await?;
        info!(size = new_size, root = %root.to_hex(), "checkpoint published");
        Ok(next)
    }

    /// Recomputes tiles/checkpoint for a range of bundles that were
    /// written directly to storage out of order (the migration copier's
    /// path). Reads bundles back, rehashes their entries, and
    /// aggregates exactly as [`Self::integrate`] would, tolerating the
    /// fact that bundles may have landed non-sequentially as long as the
    /// full `[0, target_size)` range is present by the time this runs.
    /// Publishes the resulting checkpoint unconditionally; callers that
    /// need to verify the root against an external source before
    /// publishing should use [`Self::recompute_root_from_bundles`] and
    /// [`Self::publish`] directly (see [`crate::migration`]).
    ///
    /// # Errors
    /// Returns an error if any bundle in the range is missing, malformed,
    /// or if the resulting root fails to publish.
    pub async fn finalize_from_bundles(
        &self,
        storage: &dyn Storage,
        prev: Option<&TreeState>,
        target_size: u64,
        signers: &[&dyn Signer],
    ) -> Result<TreeState, IntegratorError> {
        let root = self
            .recompute_root_from_bundles(storage, prev, target_size)
            .await?;
        self.publish(storage, prev, target_size, root, signers).await
    }

    /// Writes every tile touched by bundles `[prev.size, target_size)`
    /// (reading them back from `storage`) and returns the resulting
    /// root, without publishing a checkpoint. Safe to call before the
    /// root has been verified against an external source: tile writes
    /// not yet referenced by a published state are harmless.
    ///
    /// # Errors
    /// Returns an error if any bundle in the range is missing or malformed.
    pub async fn recompute_root_from_bundles(
        &self,
        storage: &dyn Storage,
        prev: Option<&TreeState>,
        target_size: u64,
    ) -> Result<Hash, IntegratorError> {
        let prev_size = prev.map_or(0, |s| s.size);
        if target_size <= prev_size {
            return Ok(prev.map_or(Hash::default(), |s| s.root_hash));
        }

        let mut entries = Vec::with_capacity((target_size - prev_size) as usize);
        let mut bundle_index = layout::bundle_index(prev_size);
        let mut skip = (prev_size % TILE_WIDTH) as usize;
        while (prev_size + entries.len() as u64) < target_size {
            let partial = layout::bundle_partial_size(bundle_index, target_size);
            let bytes = storage
                .get_bundle(bundle_index, partial)
                .await?
                .ok_or_else(|| {
                    IntegratorError::InvariantViolation(format!(
                        "missing bundle {bundle_index} while finalizing to size {target_size}"
                    ))
                })?;
            let decoded = bundle::decode_bundle(&bytes)?;
            entries.extend(decoded.into_iter().skip(skip));
            skip = 0;
            bundle_index += 1;
        }
        entries.truncate((target_size - prev_size) as usize);

        let leaf_hashes: Vec<Hash> = entries.iter().map(|e| hash::leaf_hash(e)).collect();
        integrate_leaves(storage, prev_size, &leaf_hashes).await?;

        let leaves = collect_leaf_hashes(storage, target_size).await?;
        Ok(hash::naive_root(&leaves))
    }

    /// Signs and publishes a checkpoint for `new_size`/`root`, atomically
    /// CAS'd against `prev`. Split out from [`Self::finalize_from_bundles`]
    /// so callers can verify a root before committing to it.
    ///
    /// # Errors
    /// Returns [`StorageError::CasConflict`] if another writer advanced
    /// the state concurrently.
    pub async fn publish(
        &self,
        storage: &dyn Storage,
        prev: Option<&TreeState>,
        new_size: u64,
        root: Hash,
        signers: &[&dyn Signer],
    ) -> Result<TreeState, IntegratorError> {
        let checkpoint = Checkpoint {
            origin: self.origin.clone(),
            size: new_size,
            root,
        };
        let note = SignedNote::sign(checkpoint, signers).await;
        let next = TreeState {
            size: new_size,
            root_hash: root,
            signed_note: note.to_bytes(),
            cas_token: prev.map_or(0, |s| s.cas_token) + 1,
        };
        storage
            .put_state(prev.map(|s| s.cas_token), next.clone())
            .await?;
        Ok(next)
    }
}

async fn write_bundles(
    storage: &dyn Storage,
    prev_size: u64,
    entries: &[Vec<u8>],
) -> Result<(), IntegratorError> {
    let new_size = prev_size + entries.len() as u64;
    let mut pos = prev_size;
    let mut remaining = entries;
    while !remaining.is_empty() {
        let bundle_index = layout::bundle_index(pos);
        let offset = pos % TILE_WIDTH;
        let take = ((TILE_WIDTH - offset).min(remaining.len() as u64)) as usize;

        let existing = if offset > 0 {
            storage.get_bundle(bundle_index, offset).await?
        } else {
            None
        };
        let new_leaves: Vec<&[u8]> = remaining[..take].iter().map(Vec::as_slice).collect();
        let bytes = bundle::append_to_bundle(existing.as_deref(), &new_leaves)?;
        let partial = layout::bundle_partial_size(bundle_index, new_size);
        storage.put_bundle(bundle_index, partial, bytes).await?;

        pos += take as u64;
        remaining = &remaining[take..];
    }
    Ok(())
}

/// Writes new leaf hashes into level-0 tiles and aggregates every
/// completed tile upward through the grid.
async fn integrate_leaves(
    storage: &dyn Storage,
    prev_size: u64,
    leaf_hashes: &[Hash],
) -> Result<(), IntegratorError> {
    let mut level = 0u32;
    let mut units: Vec<Hash> = leaf_hashes.to_vec();
    loop {
        if units.is_empty() {
            break;
        }
        let completed = write_units_to_level(storage, level, prev_size, &units).await?;
        if completed.is_empty() {
            break;
        }
        units = completed;
        level += 1;
    }
    Ok(())
}

/// Appends `units` (leaf hashes if `level == 0`, else completed
/// child-tile roots) to the tile grid at `level`, starting from the
/// position implied by the log's size before this batch. Returns the
/// roots of any tiles that became full as a result, to be fed into
/// `level + 1`.
async fn write_units_to_level(
    storage: &dyn Storage,
    level: u32,
    prev_size_before_batch: u64,
    units: &[Hash],
) -> Result<Vec<Hash>, IntegratorError> {
    let width = TILE_WIDTH;
    let mut pos = prev_size_before_batch / width.pow(level);
    let mut remaining = units;
    let mut completed = Vec::new();

    while !remaining.is_empty() {
        let tile_index = pos / width;
        let offset = pos % width;

        let existing = if offset > 0 {
            storage.get_tile(level, tile_index, offset).await?
        } else {
            None
        };
        let mut row = match existing {
            Some(bytes) => decode_hash_row(&bytes)?,
            None => Vec::new(),
        };

        let take = ((width - offset).min(remaining.len() as u64)) as usize;
        row.extend_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        pos += take as u64;

        let count = row.len() as u64;
        let partial = if count == width { 0 } else { count };
        storage
            .put_tile(level, tile_index, partial, encode_hash_row(&row))
            .await?;
        debug!(level, tile_index, partial, "tile written");
        if partial == 0 {
            completed.push(hash::naive_root(&row));
        }
    }
    Ok(completed)
}

/// Reads back the first `size` leaf hashes from level-0 tiles. This
/// reference engine recomputes the root this way (trading O(n) reads per
/// integration for a trivially auditable implementation) rather than
/// carrying forward a compact incremental hash stack across calls; see
/// DESIGN.md for the tradeoff.
async fn collect_leaf_hashes(storage: &dyn Storage, size: u64) -> Result<Vec<Hash>, IntegratorError> {
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut leaves = Vec::with_capacity(size as usize);
    let last_tile = (size - 1) / TILE_WIDTH;
    for tile_index in 0..=last_tile {
        let partial = layout::partial_tile_size(0, tile_index, size);
        let bytes = storage
            .get_tile(0, tile_index, partial)
            .await?
            .ok_or_else(|| {
                IntegratorError::InvariantViolation(format!(
                    "missing level-0 tile {tile_index} while computing root for size {size}"
                ))
            })?;
        leaves.extend(decode_hash_row(&bytes)?);
    }
    leaves.truncate(size as usize);
    Ok(leaves)
}

fn encode_hash_row(row: &[Hash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(row.len() * 32);
    for h in row {
        out.extend_from_slice(h.as_bytes());
    }
    out
}

fn decode_hash_row(bytes: &[u8]) -> Result<Vec<Hash>, IntegratorError> {
    if bytes.len() % 32 != 0 {
        return Err(IntegratorError::InvariantViolation(format!(
            "tile bytes not a multiple of 32: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|c| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(c);
            Hash::from_bytes(arr)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Signer;
    use crate::storage::memory::MemoryStorage;
    use async_trait::async_trait;
    use proptest::prop_assert_eq;
    use tracing_test::traced_test;

    struct NopSigner;

    #[async_trait]
    impl Signer for NopSigner {
        fn name(&self) -> &str {
            "test"
        }
        async fn sign(&self, message: &[u8]) -> Vec<u8> {
            hash::leaf_hash(message).as_bytes().to_vec()
        }
    }

    fn entries(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("entry-{i}").into_bytes()).collect()
    }

    #[tokio::test]
    async fn s1_single_entry() {
        let storage = MemoryStorage::new();
        let integrator = Integrator::new("example.com/log");
        let signer = NopSigner;

        let state = integrator
            .integrate(&storage, None, &[b"hello".to_vec()], &[&signer])
            .await
            .unwrap();

        assert_eq!(state.size, 1);
        assert_eq!(state.root_hash, hash::leaf_hash(b"hello"));

        let bundle = storage.get_bundle(0, 1).await.unwrap().unwrap();
        assert_eq!(bundle, vec![0u8, 5, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn s3_batch_of_257() {
        let storage = MemoryStorage::new();
        let integrator = Integrator::new("example.com/log");
        let signer = NopSigner;

        let state = integrator
            .integrate(&storage, None, &entries(257), &[&signer])
            .await
            .unwrap();
        assert_eq!(state.size, 257);

        let bundle0 = storage.get_bundle(0, 0).await.unwrap().unwrap();
        assert_eq!(bundle::decode_bundle(&bundle0).unwrap().len(), 256);
        let bundle1 = storage.get_bundle(1, 1).await.unwrap().unwrap();
        assert_eq!(bundle::decode_bundle(&bundle1).unwrap().len(), 1);

        let tile0 = storage.get_tile(0, 0, 0).await.unwrap().unwrap();
        assert_eq!(decode_hash_row(&tile0).unwrap().len(), 256);
        let tile1 = storage.get_tile(0, 1, 1).await.unwrap().unwrap();
        assert_eq!(decode_hash_row(&tile1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn root_matches_naive_computation() {
        let storage = MemoryStorage::new();
        let integrator = Integrator::new("example.com/log");
        let signer = NopSigner;
        let batch = entries(613);

        let state = integrator
            .integrate(&storage, None, &batch, &[&signer])
            .await
            .unwrap();

        let leaf_hashes: Vec<Hash> = batch.iter().map(|e| hash::leaf_hash(e)).collect();
        assert_eq!(state.root_hash, hash::naive_root(&leaf_hashes));
    }

    #[tokio::test]
    async fn batched_integration_matches_one_shot() {
        let storage_batched = MemoryStorage::new();
        let storage_one_shot = MemoryStorage::new();
        let integrator = Integrator::new("example.com/log");
        let signer = NopSigner;
        let all = entries(1000);

        let mut state = None;
        for chunk in all.chunks(97) {
            state = Some(
                integrator
                    .integrate(&storage_batched, state.as_ref(), chunk, &[&signer])
                    .await
                    .unwrap(),
            );
        }

        let one_shot = integrator
            .integrate(&storage_one_shot, None, &all, &[&signer])
            .await
            .unwrap();

        assert_eq!(state.unwrap().root_hash, one_shot.root_hash);
    }

    #[tokio::test]
    async fn migration_path_produces_same_root_out_of_order() {
        let storage = MemoryStorage::new();
        let integrator = Integrator::new("example.com/log");
        let signer = NopSigner;
        let all = entries(600);

        // Simulate the migration copier writing bundles directly, out of
        // sequencer order.
        let mut bundle_indices: Vec<u64> = (0..=2).collect();
        bundle_indices.reverse();
        for bundle_index in bundle_indices {
            let start = (bundle_index * 256) as usize;
            let end = (start + 256).min(all.len());
            let refs: Vec<&[u8]> = all[start..end].iter().map(Vec::as_slice).collect();
            let bytes = bundle::encode_bundle(refs).unwrap();
            let partial = layout::bundle_partial_size(bundle_index, 600);
            storage.put_bundle(bundle_index, partial, bytes).await.unwrap();
        }

        let state = integrator
            .finalize_from_bundles(&storage, None, 600, &[&signer])
            .await
            .unwrap();

        let leaf_hashes: Vec<Hash> = all.iter().map(|e| hash::leaf_hash(e)).collect();
        assert_eq!(state.root_hash, hash::naive_root(&leaf_hashes));
    }

    #[traced_test]
    #[tokio::test]
    async fn logs_checkpoint_published_on_integrate() {
        let storage = MemoryStorage::new();
        let integrator = Integrator::new("example.com/log");
        let signer = NopSigner;

        integrator
            .integrate(&storage, None, &[b"hello".to_vec()], &[&signer])
            .await
            .unwrap();

        assert!(logs_contain("checkpoint published"));
    }

    /// Property 6 (idempotence): replaying `integrate` with the same
    /// `(prev, entries)` produces byte-identical tiles and the same root.
    #[tokio::test]
    async fn replaying_integration_is_idempotent() {
        let storage = MemoryStorage::new();
        let integrator = Integrator::new("example.com/log");
        let signer = NopSigner;
        let batch = entries(300);

        let first = integrator
            .integrate(&storage, None, &batch, &[&signer])
            .await
            .unwrap();

        // Re-run exactly the same integration against a fresh store and
        // compare tile-by-tile as well as the final root.
        let replay_storage = MemoryStorage::new();
        let second = integrator
            .integrate(&replay_storage, None, &batch, &[&signer])
            .await
            .unwrap();

        similar_asserts::assert_eq!(first.root_hash.to_hex(), second.root_hash.to_hex());
        assert_eq!(first.size, second.size);

        let tile_a = storage.get_tile(0, 0, 0).await.unwrap().unwrap();
        let tile_b = replay_storage.get_tile(0, 0, 0).await.unwrap().unwrap();
        similar_asserts::assert_eq!(tile_a, tile_b);
    }

    proptest::proptest! {
        /// Property 5 (root correctness): for arbitrary batch sizes, the
        /// tile-based integrator's root matches the naive RFC 6962 root
        /// computed directly from the leaf hashes.
        #[test]
        fn root_correctness_for_arbitrary_batch_sizes(n in 1usize..600) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            let (got_root, want_root) = rt.block_on(async {
                let storage = MemoryStorage::new();
                let integrator = Integrator::new("example.com/log");
                let signer = NopSigner;
                let batch = entries(n);

                let state = integrator
                    .integrate(&storage, None, &batch, &[&signer])
                    .await
                    .unwrap();

                let leaf_hashes: Vec<Hash> = batch.iter().map(|e| hash::leaf_hash(e)).collect();
                (state.root_hash, hash::naive_root(&leaf_hashes))
            });
            prop_assert_eq!(got_root, want_root);
        }
    }
}
