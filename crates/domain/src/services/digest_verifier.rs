use crate::entities::Sha1Hash;
use crate::errors::VerifyError;
use crate::services::pending_writes::PendingWrites;
use crate::storage::PieceStorage;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Everything a worker needs to re-hash one piece.
#[derive(Clone)]
pub struct DigestJob {
    pub index: usize,
    pub expected: Sha1Hash,
    pub length: u64,
    pub storage: Arc<dyn PieceStorage>,
    pub writes: PendingWrites,
}

/// The owner of the pieces. `retrieve` hands out a job (and may record that
/// hashing started); `complete` receives exactly one result per attempt.
#[async_trait]
pub trait DigestTarget: Send + Sync + 'static {
    async fn retrieve(&self, index: usize) -> Option<DigestJob>;
    async fn complete(&self, index: usize, result: Result<(), VerifyError>);
}

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<usize>,
    queued: HashSet<usize>,
    reaping: usize,
}

/// Bounded pool of tasks draining a shared queue of piece indices.
#[derive(Clone)]
pub struct DigestVerifier {
    target: Arc<dyn DigestTarget>,
    queue: Arc<Mutex<Queue>>,
    limit: usize,
}

impl DigestVerifier {
    /// `limit == 0` uses the available parallelism.
    pub fn new(target: Arc<dyn DigestTarget>, limit: usize) -> Self {
        let limit = if limit == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            limit
        };

        Self {
            target,
            queue: Arc::new(Mutex::new(Queue::default())),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Queue a piece for hashing. A piece already waiting is not queued
    /// twice. Must be called from within a tokio runtime.
    pub fn enqueue(&self, index: usize) {
        let spawn = {
            let mut queue = lock(&self.queue);
            if !queue.queued.insert(index) {
                return;
            }
            queue.pending.push_back(index);

            if queue.reaping < self.limit {
                queue.reaping += 1;
                true
            } else {
                false
            }
        };

        if spawn {
            tokio::spawn(drain(self.target.clone(), self.queue.clone()));
        }
    }

    pub fn active_workers(&self) -> usize {
        lock(&self.queue).reaping
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).pending.len()
    }
}

fn lock(queue: &Mutex<Queue>) -> MutexGuard<'_, Queue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drain(target: Arc<dyn DigestTarget>, queue: Arc<Mutex<Queue>>) {
    loop {
        // Popping and retiring happen under the same lock as enqueue, so an
        // index is never left behind without a worker.
        let index = {
            let mut queue = lock(&queue);
            match queue.pending.pop_front() {
                Some(index) => {
                    queue.queued.remove(&index);
                    index
                }
                None => {
                    queue.reaping -= 1;
                    return;
                }
            }
        };

        check(target.as_ref(), index).await;
    }
}

async fn check(target: &dyn DigestTarget, index: usize) {
    let result = match target.retrieve(index).await {
        Some(job) => verify(&job).await,
        None => Err(VerifyError::NotFound(index)),
    };

    debug!(piece = index, passed = result.is_ok(), "hashed piece");
    target.complete(index, result).await;
}

/// Hash a piece once its pending writes have drained.
pub async fn compute_digest(job: &DigestJob) -> Result<Sha1Hash, VerifyError> {
    job.writes.wait_idle().await;

    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE.min(job.length.max(1) as usize)];
    let mut read = 0u64;

    while read < job.length {
        let want = (job.length - read).min(buffer.len() as u64) as usize;
        let n = job
            .storage
            .read_at(&mut buffer[..want], read)
            .await
            .map_err(|e| VerifyError::Read {
                index: job.index,
                message: e.to_string(),
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        read += n as u64;
    }

    if read != job.length {
        return Err(VerifyError::ShortRead {
            index: job.index,
            read,
            expected: job.length,
        });
    }

    Ok(Sha1Hash(hasher.finalize().into()))
}

pub async fn verify(job: &DigestJob) -> Result<(), VerifyError> {
    let actual = compute_digest(job).await?;
    if actual != job.expected {
        return Err(VerifyError::Mismatch {
            index: job.index,
            expected: job.expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TorrentInfo;
    use crate::storage::{MemoryStorage, TorrentStorage};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    struct StorageTarget {
        info: TorrentInfo,
        storage: MemoryStorage,
        results: mpsc::UnboundedSender<(usize, Result<(), VerifyError>)>,
    }

    #[async_trait]
    impl DigestTarget for StorageTarget {
        async fn retrieve(&self, index: usize) -> Option<DigestJob> {
            Some(DigestJob {
                index,
                expected: self.info.piece_hash(index)?,
                length: self.info.piece_len(index),
                storage: self.storage.piece(index),
                writes: PendingWrites::new(),
            })
        }

        async fn complete(&self, index: usize, result: Result<(), VerifyError>) {
            let _ = self.results.send((index, result));
        }
    }

    fn content() -> Vec<u8> {
        (0..300u32).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn reports_match_mismatch_and_short_read() {
        let data = content();
        let info = TorrentInfo::from_bytes("digest", 100, &data);
        let storage = MemoryStorage::with_data(&info, data);
        storage.corrupt(150);
        storage.truncate_piece(2, 60);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let verifier = DigestVerifier::new(
            Arc::new(StorageTarget {
                info: info.clone(),
                storage,
                results: tx,
            }),
            2,
        );

        for index in 0..3 {
            verifier.enqueue(index);
        }

        let mut results = HashMap::new();
        for _ in 0..3 {
            let (index, result) = rx.recv().await.unwrap();
            results.insert(index, result);
        }

        assert_eq!(results[&0], Ok(()));
        assert!(matches!(results[&1], Err(VerifyError::Mismatch { index: 1, .. })));
        assert_eq!(
            results[&2],
            Err(VerifyError::ShortRead {
                index: 2,
                read: 60,
                expected: 100
            })
        );
    }

    #[tokio::test]
    async fn missing_piece_is_not_found() {
        let info = TorrentInfo::from_bytes("digest", 100, &content());
        let storage = MemoryStorage::new(&info);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let verifier = DigestVerifier::new(
            Arc::new(StorageTarget {
                info,
                storage,
                results: tx,
            }),
            1,
        );

        verifier.enqueue(9);
        assert_eq!(rx.recv().await.unwrap(), (9, Err(VerifyError::NotFound(9))));
    }

    #[tokio::test]
    async fn hashing_waits_for_pending_writes() {
        let data = content();
        let info = TorrentInfo::from_bytes("digest", 100, &data);
        let storage = MemoryStorage::new(&info);
        let writes = PendingWrites::new();
        let guard = writes.begin();
        let job = DigestJob {
            index: 0,
            expected: info.pieces[0],
            length: 100,
            storage: storage.piece(0),
            writes,
        };

        let task = tokio::spawn(async move { verify(&job).await });
        storage.piece(0).write_at(&data[..100], 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        drop(guard);
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    struct CountingTarget {
        active: AtomicUsize,
        max_active: AtomicUsize,
        verified: Mutex<HashMap<usize, usize>>,
        done: mpsc::UnboundedSender<usize>,
    }

    #[async_trait]
    impl DigestTarget for CountingTarget {
        async fn retrieve(&self, _index: usize) -> Option<DigestJob> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            None
        }

        async fn complete(&self, index: usize, _result: Result<(), VerifyError>) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            *self.verified.lock().unwrap().entry(index).or_default() += 1;
            let _ = self.done.send(index);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_and_every_index_checked_once() {
        let limit = 3;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = Arc::new(CountingTarget {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            verified: Mutex::new(HashMap::new()),
            done: tx,
        });
        let verifier = DigestVerifier::new(target.clone(), limit);

        let count = limit * 10;
        let producers: Vec<_> = (0..count)
            .collect::<Vec<_>>()
            .chunks(5)
            .map(|batch| {
                let verifier = verifier.clone();
                let batch = batch.to_vec();
                tokio::spawn(async move {
                    for index in batch {
                        verifier.enqueue(index);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        for _ in 0..count {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }

        assert!(target.max_active.load(Ordering::SeqCst) <= limit);
        let verified = target.verified.lock().unwrap();
        assert_eq!(verified.len(), count);
        assert!(verified.values().all(|n| *n == 1));

        tokio::time::timeout(Duration::from_secs(1), async {
            while verifier.active_workers() != 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    struct BlockingTarget {
        started: mpsc::UnboundedSender<usize>,
        release: Notify,
    }

    #[async_trait]
    impl DigestTarget for BlockingTarget {
        async fn retrieve(&self, index: usize) -> Option<DigestJob> {
            let _ = self.started.send(index);
            self.release.notified().await;
            None
        }

        async fn complete(&self, _index: usize, _result: Result<(), VerifyError>) {}
    }

    #[tokio::test]
    async fn waiting_piece_is_queued_once() {
        let (tx, mut started) = mpsc::unbounded_channel();
        let target = Arc::new(BlockingTarget {
            started: tx,
            release: Notify::new(),
        });
        let verifier = DigestVerifier::new(target.clone(), 1);

        verifier.enqueue(0);
        assert_eq!(started.recv().await, Some(0));

        verifier.enqueue(1);
        verifier.enqueue(1);
        assert_eq!(verifier.queued(), 1);
        assert_eq!(verifier.active_workers(), 1);

        target.release.notify_one();
        assert_eq!(started.recv().await, Some(1));
        target.release.notify_one();
    }
}
