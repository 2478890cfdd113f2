use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteEpoch {
    pub pending: usize,
    pub generation: u64,
}

/// Barrier counting writes in flight for one piece. Hashing waits for it to
/// drain so it never digests a half-written chunk.
#[derive(Debug, Clone)]
pub struct PendingWrites {
    tx: Arc<watch::Sender<WriteEpoch>>,
}

impl Default for PendingWrites {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingWrites {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(WriteEpoch::default());
        Self { tx: Arc::new(tx) }
    }

    /// Register a write. The write stays pending until the guard drops.
    pub fn begin(&self) -> WriteGuard {
        self.tx.send_modify(|epoch| epoch.pending += 1);
        WriteGuard {
            tx: self.tx.clone(),
        }
    }

    pub fn epoch(&self) -> WriteEpoch {
        *self.tx.borrow()
    }

    pub fn pending(&self) -> usize {
        self.epoch().pending
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|epoch| epoch.pending == 0).await;
    }
}

#[derive(Debug)]
pub struct WriteGuard {
    tx: Arc<watch::Sender<WriteEpoch>>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|epoch| {
            epoch.pending = match epoch.pending.checked_sub(1) {
                Some(pending) => pending,
                None => panic!("pending writes underflow"),
            };
            epoch.generation += 1;
        });
    }
}
