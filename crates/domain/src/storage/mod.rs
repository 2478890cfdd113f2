pub mod memory;

pub use memory::MemoryStorage;

use crate::entities::Completion;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Byte access to a single piece. Offsets are relative to the start of the
/// piece; reads and writes past the piece end are clipped.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    async fn mark_complete(&self) -> io::Result<()>;
    async fn mark_not_complete(&self) -> io::Result<()>;
    async fn completion(&self) -> Completion;
}

/// Backing store for a whole torrent. Pieces address disjoint ranges, so
/// handles for different pieces may be used concurrently.
#[async_trait]
pub trait TorrentStorage: Send + Sync {
    fn piece(&self, index: usize) -> Arc<dyn PieceStorage>;
    async fn close(&self) -> io::Result<()>;
}

/// Read a piece slice starting at `offset` until `buf` is full or storage
/// has nothing more.
pub async fn read_full(
    storage: &dyn PieceStorage,
    buf: &mut [u8],
    offset: u64,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = storage
            .read_at(&mut buf[filled..], offset + filled as u64)
            .await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
