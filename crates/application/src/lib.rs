use config::Config;
use domain::*;
use infrastructure::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// A running torrent plus the channel its dial requests arrive on.
pub struct ActiveTorrent {
    pub handle: TorrentHandle,
    pub task: JoinHandle<()>,
    pub dials: mpsc::UnboundedReceiver<Peer>,
}

/// Swarm Application - wires configuration, persistence and the domain
/// services together
pub struct SwarmApp {
    config: Config,
    completion: Arc<dyn PieceCompletionRepository>,
}

impl SwarmApp {
    pub fn open(config: Config) -> Result<Self, DomainError> {
        std::fs::create_dir_all(&config.data_dir)?;
        if let Some(parent) = config.completion_db.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Infrastructure layer - completion database
        let database_path = config.completion_db.to_string_lossy().into_owned();
        let database = Database::new(&database_path)?;
        let completion: Arc<dyn PieceCompletionRepository> = Arc::new(
            SqlitePieceCompletionRepository::new(database.get_pool().clone()),
        );
        info!(path = %database_path, "completion database ready");

        Ok(Self { config, completion })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn torrent_options(&self) -> TorrentOptions {
        let config = &self.config;
        TorrentOptions {
            chunk_size: config.chunk_size,
            readahead: config.readahead_bytes,
            verifier_workers: config.verifier_workers,
            limits: ConnectionLimits {
                max_established: config.established_conns_per_torrent,
                half_open_ceiling: config.half_open_conns_per_torrent,
                peers_high_water: config.torrent_peers_high_water,
                peers_low_water: config.torrent_peers_low_water,
                grace: config.connection_grace,
            },
            seeding: config.seed,
        }
    }

    /// Start a torrent over content stored at `path` (created if missing).
    pub async fn start(&self, info: TorrentInfo, path: &Path) -> Result<ActiveTorrent, DomainError> {
        let storage = FileStorage::open(path, &info, self.completion.clone()).await?;
        let (dialer, dials) = ChannelDialer::new();
        let (handle, task) = TorrentService::spawn(
            info,
            Arc::new(storage),
            Arc::new(dialer),
            self.torrent_options(),
        );
        Ok(ActiveTorrent { handle, task, dials })
    }

    /// Describe a local file, serve it in place and verify every piece.
    pub async fn seed_file(&self, path: impl AsRef<Path>) -> Result<ActiveTorrent, DomainError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DomainError::ValidationError(format!("Not a file path: {}", path.display()))
            })?;

        let file = tokio::fs::File::open(path).await?;
        let info = TorrentInfo::from_reader(name, self.config.piece_length, file).await?;
        info!(
            info_hash = %info.info_hash(),
            pieces = info.num_pieces(),
            bytes = info.total_length,
            "hashed local content"
        );

        let torrent = self.start(info, path).await?;
        torrent.handle.verify_all().await?;
        Ok(torrent)
    }

    /// Where downloaded content for `info` is kept.
    pub fn content_path(&self, info: &TorrentInfo) -> PathBuf {
        self.config
            .data_dir
            .join(info.info_hash().to_hex())
            .join(&info.name)
    }
}
