use crate::errors::DomainError;
use crate::services::priority_scheduler::{ReaderCursor, ReaderId};
use crate::services::torrent_service::TorrentHandle;

/// Sequential reader over a byte region of a torrent. Moving the position
/// reprioritizes the pieces under and ahead of it; reads only ever return
/// verified bytes and wait for them otherwise.
pub struct Reader {
    handle: TorrentHandle,
    id: ReaderId,
    cursor: ReaderCursor,
}

impl Reader {
    pub(crate) fn new(handle: TorrentHandle, id: ReaderId, cursor: ReaderCursor) -> Self {
        Self { handle, id, cursor }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    /// Absolute torrent offset of the next read.
    pub fn position(&self) -> u64 {
        self.cursor.position
    }

    pub fn region(&self) -> (u64, u64) {
        self.cursor.region
    }

    pub fn remaining(&self) -> u64 {
        self.cursor.region.1.saturating_sub(self.cursor.position)
    }

    /// Seek within the region. Positions past the end are clamped to it.
    pub async fn set_position(&mut self, position: u64) -> Result<(), DomainError> {
        let (start, end) = self.cursor.region;
        let position = position.clamp(start, end);
        self.update(self.cursor.at(position)).await
    }

    pub async fn set_readahead(&mut self, readahead: u64) -> Result<(), DomainError> {
        let mut cursor = self.cursor;
        cursor.readahead = readahead;
        self.update(cursor).await
    }

    async fn update(&mut self, cursor: ReaderCursor) -> Result<(), DomainError> {
        if cursor == self.cursor {
            return Ok(());
        }
        self.handle.set_reader(self.id, cursor).await?;
        self.cursor = cursor;
        Ok(())
    }

    /// Read up to `buf.len()` bytes without crossing a piece boundary.
    /// Returns 0 at the end of the region and `Closed` if the torrent closes
    /// while waiting.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, DomainError> {
        let position = self.cursor.position;
        let len = (buf.len() as u64).min(self.remaining()) as usize;
        if len == 0 {
            return Ok(0);
        }

        let piece_length = self.handle.snapshot().geometry.piece_length;
        if piece_length == 0 {
            return Err(DomainError::ValidationError(
                "Cannot read content with zero piece length".to_string(),
            ));
        }
        let index = (position / piece_length) as usize;
        self.handle
            .wait_until(|s| s.piece_complete(index))
            .await?;

        let n = self.handle.read_verified(&mut buf[..len], position).await?;
        if n == 0 {
            return Err(DomainError::StorageError(format!(
                "piece {} is complete but returned no data",
                index
            )));
        }
        self.update(self.cursor.at(position + n as u64)).await?;
        Ok(n)
    }

    /// Read until `buf` is full or the region ends.
    pub async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<usize, DomainError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.handle.remove_reader(self.id);
    }
}
