//! Storage driver interface.
//!
//! Everything concrete — object store, SQL, filesystem — is explicitly out
//! of scope; this module only defines the capability trait every
//! subsystem above it depends on, plus an error taxonomy so callers can
//! classify failures without downcasting.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

/// Attached to every [`StorageError`] so the queue worker and migration
/// retry loop can decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with backoff (CAS loss, 5xx from the object store).
    TransientStorage,
    /// Surface to the caller; do not advance state.
    PermanentStorage,
    /// Fatal: root mismatch, bundle length disagreement, index gap.
    InvariantViolation,
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("compare-and-swap on the state record lost to a concurrent writer")]
    CasConflict,
    #[error("storage backend unavailable: {0}")]
    Transient(String),
    #[error("storage backend rejected the operation: {0}")]
    Permanent(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl StorageError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CasConflict | Self::Transient(_) => ErrorKind::TransientStorage,
            Self::Permanent(_) => ErrorKind::PermanentStorage,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientStorage)
    }
}

/// The persisted tree state record: `size`, `root_hash` and the latest
/// signed checkpoint note, plus an opaque CAS token the driver uses to
/// detect concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeState {
    pub size: u64,
    pub root_hash: crate::hash::Hash,
    pub signed_note: Vec<u8>,
    pub cas_token: u64,
}

impl TreeState {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            size: 0,
            root_hash: crate::hash::Hash::default(),
            signed_note: Vec::new(),
            cas_token: 0,
        }
    }
}

/// Capability interface consumed by the sequencer, integrator and
/// migration copier. Implementations (object store, SQL, filesystem) are
/// out of scope here; [`memory::MemoryStorage`] is a reference
/// implementation used by the crate's own tests.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads the current tree state, or `None` if the log is empty.
    async fn get_state(&self) -> Result<Option<TreeState>, StorageError>;

    /// Atomically replaces the state record. `prev` must be the
    /// `cas_token` last observed by the caller (or `None` for an empty
    /// log); a mismatch returns [`StorageError::CasConflict`].
    async fn put_state(&self, prev_token: Option<u64>, next: TreeState) -> Result<(), StorageError>;

    async fn get_tile(
        &self,
        tile_level: u32,
        tile_index: u64,
        partial: u64,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put_tile(
        &self,
        tile_level: u32,
        tile_index: u64,
        partial: u64,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError>;

    async fn get_bundle(
        &self,
        bundle_index: u64,
        partial: u64,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put_bundle(
        &self,
        bundle_index: u64,
        partial: u64,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError>;
}
