use async_trait::async_trait;
use domain::{
    ChunkGeometry, Completion, InfoHash, PieceCompletionRepository, PieceKey, PieceStorage,
    TorrentInfo, TorrentStorage,
};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Shared {
    path: PathBuf,
    info_hash: InfoHash,
    geometry: ChunkGeometry,
    file: Mutex<File>,
    completion: Arc<dyn PieceCompletionRepository>,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "storage closed"));
        }
        Ok(())
    }
}

/// Torrent content in one preallocated file, with completion kept in a
/// `PieceCompletionRepository`.
#[derive(Clone)]
pub struct FileStorage {
    shared: Arc<Shared>,
}

impl FileStorage {
    /// Open or create the content file at `path`, sized to the torrent.
    pub async fn open(
        path: impl AsRef<Path>,
        info: &TorrentInfo,
        completion: Arc<dyn PieceCompletionRepository>,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        if file.metadata().await?.len() != info.total_length {
            file.set_len(info.total_length).await?;
        }
        debug!(path = %path.display(), bytes = info.total_length, "opened content file");

        Ok(Self {
            shared: Arc::new(Shared {
                path,
                info_hash: info.info_hash(),
                geometry: ChunkGeometry::new(info.total_length, info.piece_length, 1),
                file: Mutex::new(file),
                completion,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

#[async_trait]
impl TorrentStorage for FileStorage {
    fn piece(&self, index: usize) -> Arc<dyn PieceStorage> {
        let geometry = &self.shared.geometry;
        Arc::new(FilePiece {
            shared: self.shared.clone(),
            key: PieceKey::new(self.shared.info_hash, index),
            offset: geometry.piece_offset(index),
            len: geometry.piece_len(index),
        })
    }

    async fn close(&self) -> io::Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut file = self.shared.file.lock().await;
        file.flush().await?;
        file.sync_all().await
    }
}

struct FilePiece {
    shared: Arc<Shared>,
    key: PieceKey,
    offset: u64,
    len: u64,
}

impl FilePiece {
    /// Bytes of the piece available from `offset`, capped at `want`.
    fn clip(&self, offset: u64, want: usize) -> usize {
        (want as u64).min(self.len.saturating_sub(offset)) as usize
    }
}

fn repository_error(e: domain::DomainError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[async_trait]
impl PieceStorage for FilePiece {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.shared.ensure_open()?;
        let len = self.clip(offset, buf.len());
        if len == 0 {
            return Ok(0);
        }

        let mut file = self.shared.file.lock().await;
        file.seek(SeekFrom::Start(self.offset + offset)).await?;
        file.read(&mut buf[..len]).await
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.shared.ensure_open()?;
        let len = self.clip(offset, buf.len());
        if len == 0 {
            return Ok(0);
        }

        let mut file = self.shared.file.lock().await;
        file.seek(SeekFrom::Start(self.offset + offset)).await?;
        file.write_all(&buf[..len]).await?;
        Ok(len)
    }

    async fn mark_complete(&self) -> io::Result<()> {
        self.shared.ensure_open()?;
        {
            let mut file = self.shared.file.lock().await;
            file.flush().await?;
        }
        self.shared
            .completion
            .set(self.key, true)
            .await
            .map_err(repository_error)
    }

    async fn mark_not_complete(&self) -> io::Result<()> {
        self.shared.ensure_open()?;
        self.shared
            .completion
            .set(self.key, false)
            .await
            .map_err(repository_error)
    }

    async fn completion(&self) -> Completion {
        match self.shared.completion.get(self.key).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(piece = self.key.index, error = %e, "completion lookup failed");
                Completion::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::storage::read_full;
    use domain::MemoryPieceCompletion;

    const PIECE: u64 = 32;

    fn content() -> Vec<u8> {
        (0..100u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn writes_land_at_piece_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let info = TorrentInfo::from_bytes("file", PIECE, &data);
        let completion = Arc::new(MemoryPieceCompletion::new());
        let storage = FileStorage::open(dir.path().join("content/file.bin"), &info, completion)
            .await
            .unwrap();

        for index in 0..info.num_pieces() {
            let start = info.piece_offset(index) as usize;
            let end = start + info.piece_len(index) as usize;
            let piece = storage.piece(index);
            assert_eq!(piece.write_at(&data[start..end], 0).await.unwrap(), end - start);
        }

        // The last piece is 4 bytes long; writes past it are clipped.
        let last = storage.piece(3);
        assert_eq!(last.write_at(&[0u8; 10], 2).await.unwrap(), 2);
        last.write_at(&data[98..100], 2).await.unwrap();

        let mut buf = vec![0u8; 40];
        let n = read_full(storage.piece(1).as_ref(), &mut buf, 4).await.unwrap();
        assert_eq!(n, 28);
        assert_eq!(&buf[..n], &data[36..64]);

        storage.close().await.unwrap();
        assert_eq!(tokio::fs::read(storage.path()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn completion_is_delegated_to_repository() {
        let dir = tempfile::tempdir().unwrap();
        let info = TorrentInfo::from_bytes("file", PIECE, &content());
        let completion = Arc::new(MemoryPieceCompletion::new());
        let storage = FileStorage::open(dir.path().join("file.bin"), &info, completion.clone())
            .await
            .unwrap();

        let piece = storage.piece(2);
        assert_eq!(piece.completion().await, Completion::default());
        piece.mark_complete().await.unwrap();
        assert_eq!(piece.completion().await, Completion::known(true));
        assert_eq!(
            completion
                .get(PieceKey::new(info.info_hash(), 2))
                .await
                .unwrap(),
            Completion::known(true)
        );
        piece.mark_not_complete().await.unwrap();
        assert_eq!(piece.completion().await, Completion::known(false));
    }

    #[tokio::test]
    async fn closed_storage_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let info = TorrentInfo::from_bytes("file", PIECE, &content());
        let storage = FileStorage::open(
            dir.path().join("file.bin"),
            &info,
            Arc::new(MemoryPieceCompletion::new()),
        )
        .await
        .unwrap();
        let piece = storage.piece(0);
        storage.close().await.unwrap();
        storage.close().await.unwrap();

        let mut buf = [0u8; 4];
        assert!(piece.read_at(&mut buf, 0).await.is_err());
        assert!(piece.write_at(&buf, 0).await.is_err());
        assert!(piece.mark_complete().await.is_err());
    }
}
