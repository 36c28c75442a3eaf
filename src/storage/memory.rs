//! In-memory reference [`Storage`] implementation.
//!
//! Concrete durable stores are external collaborators; this one is used
//! throughout this crate's own test suite and as a runnable example of
//! the trait contract. Tiles and bundles are keyed by `(level, index)` /
//! `bundle_index` only: the `partial` argument is a read-time addressing
//! convention, not a separate storage slot — a tile/bundle is overwritten
//! in place as it grows and becomes immutable once full.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ErrorKind, Storage, StorageError, TreeState};

#[derive(Default)]
struct Inner {
    state: Option<TreeState>,
    tiles: HashMap<(u32, u64), Vec<u8>>,
    bundles: HashMap<u64, Vec<u8>>,
}

/// Thread-safe, process-local [`Storage`]. Suitable for tests and for a
/// single-process deployment that doesn't need durability.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_state(&self) -> Result<Option<TreeState>, StorageError> {
        Ok(self.inner.lock().unwrap().state.clone())
    }

    async fn put_state(&self, prev_token: Option<u64>, next: TreeState) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let current_token = inner.state.as_ref().map(|s| s.cas_token);
        if current_token != prev_token {
            return Err(StorageError::CasConflict);
        }
        if let Some(current) = &inner.state {
            if next.size < current.size {
                return Err(StorageError::InvariantViolation(format!(
                    "checkpoint size must never decrease: {} -> {}",
                    current.size, next.size
                )));
            }
        }
        inner.state = Some(next);
        Ok(())
    }

    async fn get_tile(
        &self,
        tile_level: u32,
        tile_index: u64,
        _partial: u64,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().unwrap().tiles.get(&(tile_level, tile_index)).cloned())
    }

    async fn put_tile(
        &self,
        tile_level: u32,
        tile_index: u64,
        _partial: u64,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .tiles
            .insert((tile_level, tile_index), bytes);
        Ok(())
    }

    async fn get_bundle(&self, bundle_index: u64, _partial: u64) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().unwrap().bundles.get(&bundle_index).cloned())
    }

    async fn put_bundle(
        &self,
        bundle_index: u64,
        _partial: u64,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.inner.lock().unwrap().bundles.insert(bundle_index, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_state_has_no_record() {
        let storage = MemoryStorage::new();
        assert!(storage.get_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_conflict_on_stale_token() {
        let storage = MemoryStorage::new();
        storage
            .put_state(None, TreeState { cas_token: 1, ..TreeState::empty() })
            .await
            .unwrap();

        let result = storage
            .put_state(None, TreeState { cas_token: 2, ..TreeState::empty() })
            .await;
        assert!(matches!(result, Err(StorageError::CasConflict)));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::TransientStorage);
    }

    #[tokio::test]
    async fn size_must_not_decrease() {
        let storage = MemoryStorage::new();
        storage
            .put_state(None, TreeState { size: 5, cas_token: 1, ..TreeState::empty() })
            .await
            .unwrap();

        let result = storage
            .put_state(Some(1), TreeState { size: 4, cas_token: 2, ..TreeState::empty() })
            .await;
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn tile_round_trip_ignores_partial_on_read() {
        let storage = MemoryStorage::new();
        storage.put_tile(0, 3, 17, vec![1, 2, 3]).await.unwrap();
        assert_eq!(storage.get_tile(0, 3, 0).await.unwrap(), Some(vec![1, 2, 3]));
    }
}
