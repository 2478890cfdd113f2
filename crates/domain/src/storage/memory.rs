use super::{PieceStorage, TorrentStorage};
use crate::entities::{ChunkGeometry, Completion, TorrentInfo};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Faults {
    reject_mark_complete: HashSet<usize>,
    reject_writes: HashSet<usize>,
    truncated: HashMap<usize, u64>,
}

#[derive(Debug)]
struct Inner {
    geometry: ChunkGeometry,
    data: Mutex<Vec<u8>>,
    completion: Mutex<Vec<Option<bool>>>,
    faults: Mutex<Faults>,
    closed: Mutex<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Whole torrent held in memory. Supports injected faults so tests can
/// exercise the failure paths of verification and durability.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new(info: &TorrentInfo) -> Self {
        Self::with_data(info, vec![0u8; info.total_length as usize])
    }

    pub fn with_data(info: &TorrentInfo, mut data: Vec<u8>) -> Self {
        data.resize(info.total_length as usize, 0);
        let geometry = ChunkGeometry::new(info.total_length, info.piece_length, 1);
        Self {
            inner: Arc::new(Inner {
                geometry,
                data: Mutex::new(data),
                completion: Mutex::new(vec![None; info.num_pieces()]),
                faults: Mutex::new(Faults::default()),
                closed: Mutex::new(false),
            }),
        }
    }

    /// Record every piece as complete, as if a previous session verified
    /// them.
    pub fn set_all_complete(&self, complete: bool) {
        if let Ok(mut completion) = self.inner.completion.lock() {
            completion.iter_mut().for_each(|c| *c = Some(complete));
        }
    }

    pub fn set_complete(&self, index: usize, complete: Option<bool>) {
        if let Ok(mut completion) = self.inner.completion.lock() {
            if let Some(slot) = completion.get_mut(index) {
                *slot = complete;
            }
        }
    }

    /// Flip one byte of the stored content.
    pub fn corrupt(&self, offset: u64) {
        if let Ok(mut data) = self.inner.data.lock() {
            if let Some(byte) = data.get_mut(offset as usize) {
                *byte ^= 0xff;
            }
        }
    }

    pub fn reject_mark_complete(&self, index: usize, reject: bool) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            if reject {
                faults.reject_mark_complete.insert(index);
            } else {
                faults.reject_mark_complete.remove(&index);
            }
        }
    }

    pub fn reject_writes(&self, index: usize, reject: bool) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            if reject {
                faults.reject_writes.insert(index);
            } else {
                faults.reject_writes.remove(&index);
            }
        }
    }

    /// Make reads of a piece stop after `len` bytes.
    pub fn truncate_piece(&self, index: usize, len: u64) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.truncated.insert(index, len);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().map(|c| *c).unwrap_or(true)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .data
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TorrentStorage for MemoryStorage {
    fn piece(&self, index: usize) -> Arc<dyn PieceStorage> {
        Arc::new(MemoryPiece {
            inner: self.inner.clone(),
            index,
            offset: self.inner.geometry.piece_offset(index),
            len: self.inner.geometry.piece_len(index),
        })
    }

    async fn close(&self) -> io::Result<()> {
        *lock(&self.inner.closed)? = true;
        Ok(())
    }
}

struct MemoryPiece {
    inner: Arc<Inner>,
    index: usize,
    offset: u64,
    len: u64,
}

impl MemoryPiece {
    fn readable_len(&self) -> io::Result<u64> {
        let faults = lock(&self.inner.faults)?;
        Ok(match faults.truncated.get(&self.index) {
            Some(limit) => (*limit).min(self.len),
            None => self.len,
        })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if *lock(&self.inner.closed)? {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "storage closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl PieceStorage for MemoryPiece {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.ensure_open()?;
        let limit = self.readable_len()?;
        if offset >= limit {
            return Ok(0);
        }
        let n = (limit - offset).min(buf.len() as u64) as usize;
        let start = (self.offset + offset) as usize;
        let data = lock(&self.inner.data)?;
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.ensure_open()?;
        if lock(&self.inner.faults)?.reject_writes.contains(&self.index) {
            return Err(io::Error::new(io::ErrorKind::Other, "write rejected"));
        }
        if offset >= self.len {
            return Ok(0);
        }
        let n = (self.len - offset).min(buf.len() as u64) as usize;
        let start = (self.offset + offset) as usize;
        let mut data = lock(&self.inner.data)?;
        data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    async fn mark_complete(&self) -> io::Result<()> {
        self.ensure_open()?;
        if lock(&self.inner.faults)?
            .reject_mark_complete
            .contains(&self.index)
        {
            return Err(io::Error::new(io::ErrorKind::Other, "mark complete rejected"));
        }
        if let Some(slot) = lock(&self.inner.completion)?.get_mut(self.index) {
            *slot = Some(true);
        }
        Ok(())
    }

    async fn mark_not_complete(&self) -> io::Result<()> {
        if let Some(slot) = lock(&self.inner.completion)?.get_mut(self.index) {
            *slot = Some(false);
        }
        Ok(())
    }

    async fn completion(&self) -> Completion {
        match self.inner.completion.lock() {
            Ok(completion) => match completion.get(self.index).copied().flatten() {
                Some(complete) => Completion::known(complete),
                None => Completion::default(),
            },
            Err(_) => Completion::default(),
        }
    }
}
