//! Ingestion & dedup queue.
//!
//! Buffers concurrent `add` calls, collapses in-flight duplicates by
//! caller-supplied `identity`, and flushes batches to a single decoupled
//! worker task that drives the [`Sequencer`]: a background task woken by
//! a notify handle, holding an in-memory buffer with explicit size/age
//! flush triggers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::Shared;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::Signer;
use crate::sequencer::{Sequencer, SequencerError};
use crate::storage::{ErrorKind, Storage};

/// Flush triggers: `size >= max_size` OR `age(oldest) >= max_age`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_size: usize,
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 256,
            max_age: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    /// Future was dropped/cancelled before the batch containing it flushed.
    #[error("operation cancelled")]
    Cancelled,
}

impl QueueError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sequencer(e) => e.kind(),
            Self::Cancelled => ErrorKind::PermanentStorage,
        }
    }
}

type BatchResult = Result<u64, QueueError>;
type SharedResult = Shared<Pin<Box<dyn Future<Output = BatchResult> + Send>>>;

struct BufferedEntry {
    identity: Vec<u8>,
    bytes: Vec<u8>,
    done: oneshot::Sender<BatchResult>,
}

#[derive(Default)]
struct Buffer {
    entries: Vec<BufferedEntry>,
    dedup: HashMap<Vec<u8>, SharedResult>,
}

/// Buffered, time- or size-triggered batch emitter with in-flight dedup.
///
/// `add` returns a future that resolves once the batch containing the
/// entry has been integrated (or failed). Construct with [`Queue::spawn`],
/// which also starts the single decoupled writer task.
pub struct Queue {
    buffer: StdMutex<Buffer>,
    flush_now: Arc<Notify>,
    config: QueueConfig,
}

impl Queue {
    /// Starts the queue and its background flush worker, which drives
    /// `sequencer` against `storage`/`signers` for every emitted batch.
    /// The worker runs under [`crate::utils::spawn_with_backoff`], the
    /// same supervised-spawn discipline the teacher wires every
    /// background task through: a panic inside a batch flush (a storage
    /// driver bug, say) respawns the worker after a backoff instead of
    /// silently leaving the queue with no consumer.
    #[must_use]
    pub fn spawn(
        config: QueueConfig,
        sequencer: Sequencer,
        storage: Arc<dyn Storage>,
        signers: Vec<Arc<dyn Signer>>,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            buffer: StdMutex::new(Buffer::default()),
            flush_now: Arc::new(Notify::new()),
            config,
        });

        let worker_queue = Arc::clone(&queue);
        crate::utils::spawn_with_backoff(
            move || {
                let queue = Arc::clone(&worker_queue);
                let sequencer = sequencer.clone();
                let storage = Arc::clone(&storage);
                let signers = signers.clone();
                async move {
                    worker_loop(queue, sequencer, storage, signers).await;
                    Ok(())
                }
            },
            Duration::from_secs(1),
        );

        queue
    }

    /// Submits `entry` under dedup key `identity`. If another submission
    /// with the same identity is currently buffered or integrating, this
    /// call does *not* add a new buffer slot: it returns the same future
    /// the original submitter is waiting on.
    ///
    /// # Errors
    /// Resolves to [`QueueError`] if the batch containing this entry
    /// fails to integrate; every future tied to that batch gets the same
    /// error.
    #[instrument(level = "debug", skip_all)]
    pub async fn add(&self, entry: Vec<u8>, identity: Vec<u8>) -> BatchResult {
        let shared = {
            let mut buffer = self.buffer.lock().unwrap();
            if let Some(existing) = buffer.dedup.get(&identity) {
                debug!("duplicate identity, joining in-flight batch");
                existing.clone()
            } else {
                let (tx, rx) = oneshot::channel();
                let fut: Pin<Box<dyn Future<Output = BatchResult> + Send>> = Box::pin(async move {
                    rx.await.unwrap_or(Err(QueueError::Cancelled))
                });
                let shared = fut.shared();
                buffer.dedup.insert(identity.clone(), shared.clone());
                let was_empty = buffer.entries.is_empty();
                buffer.entries.push(BufferedEntry {
                    identity,
                    bytes: entry,
                    done: tx,
                });
                let len = buffer.entries.len();
                let max_size = self.config.max_size;
                drop(buffer);

                if len >= max_size {
                    self.flush_now.notify_one();
                } else if was_empty {
                    // First item in a fresh buffer: schedule the age-based
                    // flush deadline for this batch.
                    let max_age = self.config.max_age;
                    let notify = Arc::clone(&self.flush_now);
                    tokio::spawn(async move {
                        tokio::time::sleep(max_age).await;
                        notify.notify_one();
                    });
                }
                shared
            }
        };
        shared.await
    }

    /// Drains the current buffer for the flush worker. Returns `None` if
    /// empty (spurious wakeup). The dedup entries for the drained batch are
    /// left in place: per spec.md's §4.1, they must stay live until the
    /// batch *completes* (success or failure), not merely until it's
    /// handed to the integrator, so a duplicate `add()` arriving mid-flush
    /// still joins the in-flight batch instead of starting a new one. The
    /// worker clears them itself via [`Self::clear_dedup`] once every
    /// future has been notified.
    fn take_batch(&self) -> Option<(Vec<Vec<u8>>, Vec<Vec<u8>>, Vec<oneshot::Sender<BatchResult>>)> {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.entries.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut buffer.entries);
        let mut bytes = Vec::with_capacity(entries.len());
        let mut identities = Vec::with_capacity(entries.len());
        let mut senders = Vec::with_capacity(entries.len());
        for e in entries {
            identities.push(e.identity);
            bytes.push(e.bytes);
            senders.push(e.done);
        }
        Some((bytes, identities, senders))
    }

    /// Removes the dedup entries for a completed batch's identities,
    /// permitting resubmission. Called by the worker only after every
    /// future tied to the batch has been notified.
    fn clear_dedup(&self, identities: &[Vec<u8>]) {
        let mut buffer = self.buffer.lock().unwrap();
        for identity in identities {
            buffer.dedup.remove(identity);
        }
    }
}

#[instrument(level = "info", skip_all)]
async fn worker_loop(
    queue: Arc<Queue>,
    sequencer: Sequencer,
    storage: Arc<dyn Storage>,
    signers: Vec<Arc<dyn Signer>>,
) {
    let signer_refs: Vec<&dyn Signer> = signers.iter().map(AsRef::as_ref).collect();
    loop {
        queue.flush_now.notified().await;
        let Some((bytes, identities, senders)) = queue.take_batch() else {
            continue;
        };
        let batch_len = bytes.len();
        debug!(batch_len, "flushing batch");

        let result = sequencer
            .assign_batch(storage.as_ref(), &bytes, &signer_refs)
            .await;

        match result {
            Ok(assigned) => {
                info!(start_index = assigned.start_index, batch_len, "batch integrated");
                for (i, sender) in senders.into_iter().enumerate() {
                    let _ = sender.send(Ok(assigned.start_index + i as u64));
                }
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(error = %err, "batch integration failed, retryable");
                } else {
                    tracing::error!(error = %err, "batch integration failed");
                }
                let shared_err = QueueError::from(err);
                for sender in senders {
                    let _ = sender.send(Err(shared_err.clone()));
                }
            }
        }
        // Only now, after every future has been notified, may a duplicate
        // identity be treated as a fresh submission.
        queue.clear_dedup(&identities);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::storage::memory::MemoryStorage;
    use async_trait::async_trait;

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

    fn test_queue(config: QueueConfig) -> Arc<Queue> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let sequencer = Sequencer::new("example.com/log");
        let signers: Vec<Arc<dyn Signer>> = vec![Arc::new(NopSigner)];
        Queue::spawn(config, sequencer, storage, signers)
    }

    #[tokio::test]
    async fn s1_single_add_gets_index_zero() {
        let queue = test_queue(QueueConfig {
            max_size: 1,
            max_age: Duration::from_secs(5),
        });
        let index = queue.add(b"hello".to_vec(), b"id-1".to_vec()).await.unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn flushes_on_max_size() {
        let queue = test_queue(QueueConfig {
            max_size: 2,
            max_age: Duration::from_secs(30),
        });
        let a = queue.add(b"a".to_vec(), b"id-a".to_vec());
        let b = queue.add(b"b".to_vec(), b"id-b".to_vec());
        let (ia, ib) = tokio::time::timeout(Duration::from_secs(2), futures::future::join(a, b))
            .await
            .expect("batch should flush on reaching max_size");
        let mut indices = [ia.unwrap(), ib.unwrap()];
        indices.sort_unstable();
        assert_eq!(indices, [0, 1]);
    }

    #[tokio::test]
    async fn flushes_on_max_age() {
        let queue = test_queue(QueueConfig {
            max_size: 1000,
            max_age: Duration::from_millis(50),
        });
        let index = tokio::time::timeout(
            Duration::from_secs(2),
            queue.add(b"lonely".to_vec(), b"id-lonely".to_vec()),
        )
        .await
        .expect("batch should flush on max_age")
        .unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn s2_dedup_collapses_to_one_index() {
        let queue = test_queue(QueueConfig {
            max_size: 2,
            max_age: Duration::from_secs(30),
        });
        let a = queue.add(b"x".to_vec(), b"same-identity".to_vec());
        let b = queue.add(b"x".to_vec(), b"same-identity".to_vec());
        let c = queue.add(b"x".to_vec(), b"same-identity".to_vec());
        // The three duplicates collapse into a single buffer slot, so a
        // second distinct identity is needed to reach max_size=2 and
        // trigger a deterministic flush.
        let results = tokio::time::timeout(Duration::from_secs(2), async {
            // Submit one more distinct entry to trigger the size flush
            // deterministically instead of waiting on the age timer.
            let d = queue.add(b"y".to_vec(), b"distinct".to_vec());
            futures::future::join4(a, b, c, d).await
        })
        .await
        .unwrap();
        let (ra, rb, rc, _rd) = results;
        assert_eq!(ra.unwrap(), rb.unwrap());
        assert_eq!(rb.unwrap(), rc.unwrap());
    }

    /// A signer slow enough to hold a batch mid-integration, so a test can
    /// submit a duplicate identity in the window between the batch being
    /// drained from the buffer and integration actually completing.
    struct SlowSigner {
        delay: Duration,
    }

    #[async_trait]
    impl Signer for SlowSigner {
        fn name(&self) -> &str {
            "slow-test"
        }
        async fn sign(&self, message: &[u8]) -> Vec<u8> {
            tokio::time::sleep(self.delay).await;
            hash::leaf_hash(message).as_bytes().to_vec()
        }
    }

    /// Property 2 (dedup equality): the dedup entry must stay live through
    /// integration, not just until the batch is drained from the buffer —
    /// a duplicate arriving after drain but before the batch completes must
    /// still join the in-flight batch rather than start a new one.
    #[tokio::test]
    async fn dedup_entry_survives_until_batch_completes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let sequencer = Sequencer::new("example.com/log");
        let signers: Vec<Arc<dyn Signer>> = vec![Arc::new(SlowSigner {
            delay: Duration::from_millis(200),
        })];
        let queue = Queue::spawn(
            QueueConfig {
                max_size: 1,
                max_age: Duration::from_secs(30),
            },
            sequencer,
            storage,
            signers,
        );

        let first = queue.add(b"x".to_vec(), b"same-identity".to_vec());
        // Give the worker time to drain the first batch (max_size=1 flushes
        // immediately) but not enough to finish the slow signer's sign().
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = queue.add(b"x".to_vec(), b"same-identity".to_vec());

        let (first, second) = tokio::time::timeout(
            Duration::from_secs(2),
            futures::future::join(first, second),
        )
        .await
        .unwrap();
        assert_eq!(first.unwrap(), second.unwrap());
    }
}
