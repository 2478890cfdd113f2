use crate::entities::{
    piece_state_runs, ChunkGeometry, ChunkSpec, InfoHash, Peer, PeerSource, PiecePriority,
    PieceState, TorrentInfo, TorrentStats, DEFAULT_CHUNK_SIZE,
};
use crate::errors::{DomainError, VerifyError};
use crate::services::connection_manager::{
    Admission, ConnectionId, ConnectionInfo, ConnectionLimits, ConnectionManager, Dialer,
    PeerConnection, RejectReason,
};
use crate::services::digest_verifier::{DigestJob, DigestTarget, DigestVerifier};
use crate::services::pending_writes::WriteGuard;
use crate::services::piece_registry::{ChunkOutcome, HashOutcome, PieceRegistry};
use crate::services::priority_scheduler::{request_order, PriorityScheduler, ReaderCursor, ReaderId};
use crate::services::reader::Reader;
use crate::storage::{read_full, PieceStorage, TorrentStorage};
use async_trait::async_trait;
use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default readahead of a reader, 5 MiB.
pub const DEFAULT_READAHEAD: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TorrentOptions {
    pub chunk_size: u32,
    pub readahead: u64,
    /// Concurrent digest workers; 0 uses the available parallelism.
    pub verifier_workers: usize,
    pub limits: ConnectionLimits,
    /// Keep wanting connections after every piece is complete.
    pub seeding: bool,
}

impl Default for TorrentOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            readahead: DEFAULT_READAHEAD,
            verifier_workers: 0,
            limits: ConnectionLimits::default(),
            seeding: true,
        }
    }
}

/// Immutable view of a torrent, republished after every change.
#[derive(Debug, Clone)]
pub struct TorrentSnapshot {
    pub info_hash: InfoHash,
    pub name: String,
    pub geometry: ChunkGeometry,
    pub closed: bool,
    pub pieces: Vec<PieceState>,
    pub stats: TorrentStats,
    pub connections: Vec<ConnectionInfo>,
    pub reader_windows: Vec<Range<usize>>,
    pub version: u64,
}

impl TorrentSnapshot {
    pub fn piece_complete(&self, index: usize) -> bool {
        self.pieces
            .get(index)
            .map(|p| p.completion.complete)
            .unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.completion.complete)
    }

    /// Effective priorities in piece order.
    pub fn priorities(&self) -> Vec<PiecePriority> {
        self.pieces.iter().map(|p| p.priority).collect()
    }

    pub fn request_order(&self, inclination: &[usize]) -> Vec<usize> {
        request_order(&self.priorities(), inclination)
    }

    pub fn write_status(&self, w: &mut impl fmt::Write) -> fmt::Result {
        writeln!(w, "Infohash: {}", self.info_hash)?;
        writeln!(w, "Name: {}", self.name)?;
        writeln!(w, "Piece length: {}", self.geometry.piece_length)?;
        writeln!(
            w,
            "Num Pieces: {} ({} completed)",
            self.pieces.len(),
            self.stats.pieces_complete
        )?;

        write!(w, "Piece States:")?;
        for run in piece_state_runs(&self.pieces) {
            write!(w, " {}", run.status_chars())?;
        }
        writeln!(w)?;

        write!(w, "Reader Pieces:")?;
        for window in &self.reader_windows {
            write!(w, " {}:{}", window.start, window.end)?;
        }
        writeln!(w)?;

        writeln!(
            w,
            "Bytes: {} completed, {} outstanding",
            self.stats.bytes_completed, self.stats.bytes_outstanding
        )?;
        writeln!(
            w,
            "Hashed: {} correct, {} not correct, {} failures, {} not durable",
            self.stats.pieces_hashed_correct,
            self.stats.pieces_hashed_not_correct,
            self.stats.hash_failures,
            self.stats.durability_failures
        )?;
        writeln!(
            w,
            "Peers: {} active, {} half-open, {} pending (max {})",
            self.stats.active_peers,
            self.stats.half_open_peers,
            self.stats.pending_peers,
            self.stats.max_established_conns
        )?;
        for (position, conn) in self.connections.iter().enumerate() {
            writeln!(
                w,
                "{:2}. {} {:?} useful {} wasted {}",
                position + 1,
                conn.addr,
                conn.source,
                conn.stats.chunks_read_useful,
                conn.stats.chunks_read_wasted
            )?;
        }
        Ok(())
    }

    pub fn status(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_status(&mut out);
        out
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    BeginWrite {
        conn: Option<ConnectionId>,
        spec: ChunkSpec,
        reply: Reply<Result<Option<(WriteGuard, Arc<dyn PieceStorage>)>, DomainError>>,
    },
    ChunkWritten {
        conn: Option<ConnectionId>,
        spec: ChunkSpec,
        written: Result<(), String>,
        guard: WriteGuard,
        reply: Reply<Result<ChunkOutcome, DomainError>>,
    },
    AddPeers {
        peers: Vec<Peer>,
        reply: Reply<usize>,
    },
    AddConnection {
        conn: Arc<dyn PeerConnection>,
        source: PeerSource,
        dialed: bool,
        reply: Reply<Admission>,
    },
    DropConnection {
        id: ConnectionId,
        reply: Reply<bool>,
    },
    DialFailed {
        addr: SocketAddr,
    },
    SetPiecePriority {
        index: usize,
        priority: PiecePriority,
        reply: Reply<Result<(), DomainError>>,
    },
    DownloadPieces {
        range: Range<usize>,
        reply: Reply<()>,
    },
    CancelPieces {
        range: Range<usize>,
        reply: Reply<()>,
    },
    VerifyPiece {
        index: usize,
        reply: Reply<Result<(), DomainError>>,
    },
    RecheckCompletion {
        index: usize,
        reply: Reply<Result<bool, DomainError>>,
    },
    SetReader {
        id: ReaderId,
        cursor: ReaderCursor,
        reply: Reply<()>,
    },
    RemoveReader {
        id: ReaderId,
    },
    SetMaxEstablished {
        max: usize,
        reply: Reply<usize>,
    },
    PendingChunks {
        index: usize,
        reply: Reply<Result<Vec<ChunkSpec>, DomainError>>,
    },
    Inclination {
        id: ConnectionId,
        reply: Reply<Option<Arc<Vec<usize>>>>,
    },
    HashStarted {
        index: usize,
        reply: Reply<Option<DigestJob>>,
    },
    HashFinished {
        index: usize,
        outcome: HashOutcome,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Cloneable handle to a running torrent. Every call fails with
/// `DomainError::Closed` once the torrent is closed.
#[derive(Clone)]
pub struct TorrentHandle {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Arc<TorrentSnapshot>>,
    info: Arc<TorrentInfo>,
    storage: Arc<dyn TorrentStorage>,
    readahead: u64,
}

impl TorrentHandle {
    fn ensure_open(&self) -> Result<(), DomainError> {
        if self.snapshot.borrow().closed {
            return Err(DomainError::Closed);
        }
        Ok(())
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, DomainError> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| DomainError::Closed)?;
        rx.await.map_err(|_| DomainError::Closed)
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn snapshot(&self) -> Arc<TorrentSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TorrentSnapshot>> {
        self.snapshot.clone()
    }

    pub fn stats(&self) -> TorrentStats {
        self.snapshot().stats.clone()
    }

    /// Wait until `condition` holds for a published snapshot. Fails with
    /// `Closed` if the torrent closes first.
    pub async fn wait_until(
        &self,
        condition: impl Fn(&TorrentSnapshot) -> bool,
    ) -> Result<Arc<TorrentSnapshot>, DomainError> {
        let mut rx = self.snapshot.clone();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if condition(&snapshot) {
                return Ok(snapshot);
            }
            if snapshot.closed {
                return Err(DomainError::Closed);
            }
            rx.changed().await.map_err(|_| DomainError::Closed)?;
        }
    }

    /// Store a chunk delivered by `conn` (or by a local source when `None`).
    pub async fn write_chunk(
        &self,
        conn: Option<ConnectionId>,
        spec: ChunkSpec,
        data: &[u8],
    ) -> Result<ChunkOutcome, DomainError> {
        if data.len() != spec.length as usize {
            return Err(DomainError::InvalidChunk {
                piece: spec.piece,
                begin: spec.begin,
                length: data.len() as u32,
            });
        }

        let Some((guard, storage)) = self
            .call(|reply| Command::BeginWrite { conn, spec, reply })
            .await??
        else {
            return Ok(ChunkOutcome::Wasted);
        };

        let written = match storage.write_at(data, spec.begin as u64).await {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => Err(format!("short write {} of {} bytes", n, data.len())),
            Err(e) => Err(e.to_string()),
        };

        self.call(|reply| Command::ChunkWritten {
            conn,
            spec,
            written,
            guard,
            reply,
        })
        .await?
    }

    pub async fn add_peers(&self, peers: Vec<Peer>) -> Result<usize, DomainError> {
        self.call(|reply| Command::AddPeers { peers, reply }).await
    }

    /// Offer an inbound or otherwise established connection.
    pub async fn add_connection(
        &self,
        conn: Arc<dyn PeerConnection>,
        source: PeerSource,
    ) -> Result<Admission, DomainError> {
        self.call(|reply| Command::AddConnection {
            conn,
            source,
            dialed: false,
            reply,
        })
        .await
    }

    /// Report a successful dial of a peer handed to the dialer.
    pub async fn add_dialed_connection(
        &self,
        conn: Arc<dyn PeerConnection>,
        source: PeerSource,
    ) -> Result<Admission, DomainError> {
        self.call(|reply| Command::AddConnection {
            conn,
            source,
            dialed: true,
            reply,
        })
        .await
    }

    pub async fn drop_connection(&self, id: ConnectionId) -> Result<bool, DomainError> {
        self.call(|reply| Command::DropConnection { id, reply }).await
    }

    pub fn dial_failed(&self, addr: SocketAddr) -> Result<(), DomainError> {
        self.ensure_open()?;
        self.tx
            .send(Command::DialFailed { addr })
            .map_err(|_| DomainError::Closed)
    }

    pub async fn set_piece_priority(
        &self,
        index: usize,
        priority: PiecePriority,
    ) -> Result<(), DomainError> {
        self.call(|reply| Command::SetPiecePriority {
            index,
            priority,
            reply,
        })
        .await?
    }

    /// Raise every piece in `range` to at least `Normal`.
    pub async fn download_pieces(&self, range: Range<usize>) -> Result<(), DomainError> {
        self.call(|reply| Command::DownloadPieces { range, reply }).await
    }

    pub async fn download_all(&self) -> Result<(), DomainError> {
        self.download_pieces(0..self.info.num_pieces()).await
    }

    /// Reset the explicit priority of every piece in `range`.
    pub async fn cancel_pieces(&self, range: Range<usize>) -> Result<(), DomainError> {
        self.call(|reply| Command::CancelPieces { range, reply }).await
    }

    /// Hash a piece again and wait for a verification that started after
    /// this call.
    pub async fn verify_piece(&self, index: usize) -> Result<(), DomainError> {
        self.call(|reply| Command::VerifyPiece { index, reply })
            .await?
    }

    pub async fn verify_all(&self) -> Result<(), DomainError> {
        let checks = (0..self.info.num_pieces()).map(|index| self.verify_piece(index));
        for result in futures::future::join_all(checks).await {
            result?;
        }
        Ok(())
    }

    /// Re-read a piece's completion from storage. Returns whether it changed.
    pub async fn recheck_completion(&self, index: usize) -> Result<bool, DomainError> {
        self.call(|reply| Command::RecheckCompletion { index, reply })
            .await?
    }

    pub async fn set_max_established_conns(&self, max: usize) -> Result<usize, DomainError> {
        self.call(|reply| Command::SetMaxEstablished { max, reply })
            .await
    }

    pub async fn pending_chunks(&self, index: usize) -> Result<Vec<ChunkSpec>, DomainError> {
        self.call(|reply| Command::PendingChunks { index, reply })
            .await?
    }

    /// Wanted pieces in the order connection `id` should request them.
    pub async fn request_order(&self, id: ConnectionId) -> Result<Vec<usize>, DomainError> {
        let inclination = self
            .call(|reply| Command::Inclination { id, reply })
            .await?
            .ok_or_else(|| DomainError::ValidationError(format!("Unknown connection {}", id)))?;
        Ok(self.snapshot().request_order(&inclination))
    }

    /// Open a reader over `[offset, offset + len)`, clipped to the content.
    pub async fn new_reader(&self, offset: u64, len: u64) -> Result<Reader, DomainError> {
        let total = self.info.total_length;
        if self.info.piece_length == 0 && total > 0 {
            return Err(DomainError::ValidationError(
                "Cannot read content with zero piece length".to_string(),
            ));
        }
        let start = offset.min(total);
        let len = len.min(total - start);
        let id = ReaderId::new_v4();
        let cursor = ReaderCursor::new(start, len, self.readahead);
        self.set_reader(id, cursor).await?;
        Ok(Reader::new(self.clone(), id, cursor))
    }

    pub(crate) async fn set_reader(&self, id: ReaderId, cursor: ReaderCursor) -> Result<(), DomainError> {
        self.call(|reply| Command::SetReader { id, cursor, reply })
            .await
    }

    pub(crate) fn remove_reader(&self, id: ReaderId) {
        // Nothing to remove once the actor is gone.
        let _ = self.tx.send(Command::RemoveReader { id });
    }

    /// Read verified bytes at a torrent offset, never crossing a piece end.
    pub(crate) async fn read_verified(&self, buf: &mut [u8], offset: u64) -> Result<usize, DomainError> {
        let geometry = self.snapshot().geometry;
        if geometry.piece_length == 0 {
            return Ok(0);
        }
        let index = (offset / geometry.piece_length) as usize;
        let piece_offset = offset - geometry.piece_offset(index);
        let available = geometry.piece_len(index).saturating_sub(piece_offset);
        let len = (buf.len() as u64).min(available) as usize;

        let storage = self.storage.piece(index);
        Ok(read_full(storage.as_ref(), &mut buf[..len], piece_offset).await?)
    }

    /// Terminal: closes every connection and the storage before returning.
    pub async fn close(&self) -> Result<(), DomainError> {
        self.call(|reply| Command::Close { reply }).await
    }
}

/// Verifier side of the actor: hands out jobs and reports results, telling
/// storage about the outcome before the actor sees it.
struct ActorDigestTarget {
    tx: mpsc::WeakUnboundedSender<Command>,
    storage: Arc<dyn TorrentStorage>,
    snapshot: watch::Receiver<Arc<TorrentSnapshot>>,
}

#[async_trait]
impl DigestTarget for ActorDigestTarget {
    async fn retrieve(&self, index: usize) -> Option<DigestJob> {
        let tx = self.tx.upgrade()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::HashStarted { index, reply }).ok()?;
        rx.await.ok().flatten()
    }

    async fn complete(&self, index: usize, result: Result<(), VerifyError>) {
        if self.snapshot.borrow().closed {
            debug!(piece = index, "dropping digest result after close");
            return;
        }

        // No job was handed out: the piece is already hashing or gone.
        if let Err(VerifyError::NotFound(_)) = result {
            debug!(piece = index, "no digest job handed out");
            return;
        }

        let piece = self.storage.piece(index);
        let outcome = match result {
            Ok(()) => match piece.mark_complete().await {
                Ok(()) => HashOutcome::Verified,
                Err(e) => HashOutcome::NotDurable(e.to_string()),
            },
            Err(error) => {
                if let Err(e) = piece.mark_not_complete().await {
                    warn!(piece = error.index(), error = %e, "failed to mark piece not complete");
                }
                HashOutcome::Failed(error)
            }
        };

        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(Command::HashFinished { index, outcome });
        }
    }
}

struct VerifyWaiter {
    index: usize,
    target: u64,
    reply: Reply<Result<(), DomainError>>,
}

/// Owner of all mutable torrent state. Commands are applied one at a time
/// and a fresh snapshot is published after each change.
struct TorrentActor {
    info: Arc<TorrentInfo>,
    info_hash: InfoHash,
    options: TorrentOptions,
    storage: Arc<dyn TorrentStorage>,
    dialer: Arc<dyn Dialer>,
    verifier: DigestVerifier,
    registry: PieceRegistry,
    scheduler: PriorityScheduler,
    conns: ConnectionManager,
    verify_waiters: Vec<VerifyWaiter>,
    snapshot_tx: watch::Sender<Arc<TorrentSnapshot>>,
    version: u64,
    closed: bool,
}

pub struct TorrentService;

impl TorrentService {
    /// Start the torrent actor. Must be called from within a tokio runtime.
    pub fn spawn(
        info: TorrentInfo,
        storage: Arc<dyn TorrentStorage>,
        dialer: Arc<dyn Dialer>,
        options: TorrentOptions,
    ) -> (TorrentHandle, JoinHandle<()>) {
        let info = Arc::new(info);
        let info_hash = info.info_hash();
        let registry = PieceRegistry::new(&info, options.chunk_size);
        let scheduler = PriorityScheduler::new(*registry.geometry());
        let conns = ConnectionManager::new(options.limits, info.num_pieces());

        let (tx, rx) = mpsc::unbounded_channel();
        let initial = TorrentSnapshot {
            info_hash,
            name: info.name.clone(),
            geometry: *registry.geometry(),
            closed: false,
            pieces: vec![PieceState::default(); info.num_pieces()],
            stats: TorrentStats::default(),
            connections: Vec::new(),
            reader_windows: Vec::new(),
            version: 0,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));

        let verifier = DigestVerifier::new(
            Arc::new(ActorDigestTarget {
                tx: tx.downgrade(),
                storage: storage.clone(),
                snapshot: snapshot_rx.clone(),
            }),
            options.verifier_workers,
        );

        let handle = TorrentHandle {
            tx,
            snapshot: snapshot_rx,
            info: info.clone(),
            storage: storage.clone(),
            readahead: options.readahead,
        };

        let actor = TorrentActor {
            info,
            info_hash,
            options,
            storage,
            dialer,
            verifier,
            registry,
            scheduler,
            conns,
            verify_waiters: Vec::new(),
            snapshot_tx,
            version: 0,
            closed: false,
        };

        (handle, tokio::spawn(actor.run(rx)))
    }
}

impl TorrentActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.initial_check().await;
        self.publish();
        info!(
            info_hash = %self.info_hash,
            name = %self.info.name,
            pieces = self.registry.num_pieces(),
            complete = self.registry.ledger().pieces_complete(),
            verifier_workers = self.verifier.limit(),
            "torrent started"
        );

        while let Some(command) = rx.recv().await {
            if let Command::Close { reply } = command {
                self.close().await;
                let _ = reply.send(());
                return;
            }

            if self.handle(command).await {
                self.publish();
                self.resolve_verify_waiters();
            }
        }

        // Every handle is gone.
        self.close().await;
    }

    async fn initial_check(&mut self) {
        for index in 0..self.registry.num_pieces() {
            let completion = self.storage.piece(index).completion().await;
            if let Err(e) = self.registry.apply_storage_completion(index, completion) {
                warn!(piece = index, error = %e, "initial completion check failed");
            }
        }
        self.scheduler.recompute_all(&self.registry);
    }

    fn want_data(&self) -> bool {
        self.options.seeding || self.registry.ledger().pieces_complete() < self.registry.num_pieces()
    }

    /// Handle one command. Returns whether state changed.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::BeginWrite { conn, spec, reply } => {
                let result = self.begin_write(conn, &spec);
                let changed = matches!(result, Ok(None));
                let _ = reply.send(result);
                changed
            }
            Command::ChunkWritten {
                conn,
                spec,
                written,
                guard,
                reply,
            } => {
                let result = self.chunk_written(conn, &spec, written);
                drop(guard);
                let _ = reply.send(result);
                true
            }
            Command::AddPeers { peers, reply } => {
                let added = self.conns.add_peers(peers);
                self.open_new_conns();
                let _ = reply.send(added);
                true
            }
            Command::AddConnection {
                conn,
                source,
                dialed,
                reply,
            } => {
                let admission = self.add_connection(conn, source, dialed);
                let _ = reply.send(admission);
                true
            }
            Command::DropConnection { id, reply } => {
                let dropped = self.conns.drop_connection(id).is_some();
                self.open_new_conns();
                let _ = reply.send(dropped);
                true
            }
            Command::DialFailed { addr } => {
                if self.conns.is_half_open(&addr) {
                    self.conns.drop_half_open(&addr);
                    debug!(addr = %addr, "dial failed");
                    self.open_new_conns();
                }
                true
            }
            Command::SetPiecePriority {
                index,
                priority,
                reply,
            } => {
                let result = self.registry.set_priority(index, priority).map(|_| {
                    self.update_priorities(index..index + 1);
                });
                let _ = reply.send(result);
                true
            }
            Command::DownloadPieces { range, reply } => {
                let range = self.clamp(range);
                for index in range.clone() {
                    let _ = self.registry.raise_priority(index, PiecePriority::Normal);
                }
                self.update_priorities(range);
                let _ = reply.send(());
                true
            }
            Command::CancelPieces { range, reply } => {
                let range = self.clamp(range);
                for index in range.clone() {
                    let _ = self.registry.set_priority(index, PiecePriority::None);
                }
                self.update_priorities(range);
                let _ = reply.send(());
                true
            }
            Command::VerifyPiece { index, reply } => {
                self.verify_piece(index, reply);
                true
            }
            Command::RecheckCompletion { index, reply } => {
                let result = self.recheck_completion(index).await;
                let _ = reply.send(result);
                true
            }
            Command::SetReader { id, cursor, reply } => {
                let ranges = self.scheduler.set_reader(id, &cursor);
                self.update_priority_ranges(ranges);
                let _ = reply.send(());
                true
            }
            Command::RemoveReader { id } => {
                let ranges = self.scheduler.remove_reader(&id);
                self.update_priority_ranges(ranges);
                true
            }
            Command::SetMaxEstablished { max, reply } => {
                let (old, dropped) = self.conns.set_max_established(max);
                if !dropped.is_empty() {
                    debug!(max, dropped = dropped.len(), "dropped connections over new cap");
                }
                self.open_new_conns();
                let _ = reply.send(old);
                true
            }
            Command::PendingChunks { index, reply } => {
                let _ = reply.send(self.registry.pending_chunks(index));
                false
            }
            Command::Inclination { id, reply } => {
                let _ = reply.send(self.conns.inclination(id));
                false
            }
            Command::HashStarted { index, reply } => {
                let job = if self.closed {
                    None
                } else {
                    self.registry.start_hashing(index, self.storage.as_ref())
                };
                let _ = reply.send(job);
                true
            }
            Command::HashFinished { index, outcome } => {
                self.hash_finished(index, outcome);
                true
            }
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
                true
            }
        }
    }

    fn clamp(&self, range: Range<usize>) -> Range<usize> {
        let n = self.registry.num_pieces();
        range.start.min(n)..range.end.min(n)
    }

    fn begin_write(
        &mut self,
        conn: Option<ConnectionId>,
        spec: &ChunkSpec,
    ) -> Result<Option<(WriteGuard, Arc<dyn PieceStorage>)>, DomainError> {
        match self.registry.begin_write(spec)? {
            Some(guard) => Ok(Some((guard, self.storage.piece(spec.piece)))),
            None => {
                if let Some(id) = conn {
                    self.conns
                        .record_chunk(id, spec.piece, false, spec.length as u64);
                }
                Ok(None)
            }
        }
    }

    fn chunk_written(
        &mut self,
        conn: Option<ConnectionId>,
        spec: &ChunkSpec,
        written: Result<(), String>,
    ) -> Result<ChunkOutcome, DomainError> {
        if let Err(error) = written {
            self.registry.write_failed(spec, &error);
            return Err(DomainError::StorageError(error));
        }

        let outcome = self.registry.chunk_written(spec)?;
        if let Some(id) = conn {
            let useful = matches!(outcome, ChunkOutcome::Useful { .. });
            self.conns
                .record_chunk(id, spec.piece, useful, spec.length as u64);
        }

        if outcome == (ChunkOutcome::Useful { queue_for_hash: true }) {
            self.verifier.enqueue(spec.piece);
            self.update_priorities(spec.piece..spec.piece + 1);
        }
        Ok(outcome)
    }

    fn add_connection(
        &mut self,
        conn: Arc<dyn PeerConnection>,
        source: PeerSource,
        dialed: bool,
    ) -> Admission {
        if self.closed {
            conn.close();
            return Admission::Rejected(RejectReason::Closed);
        }

        let addr = conn.remote_addr();
        if dialed && self.conns.is_half_open(&addr) {
            self.conns.drop_half_open(&addr);
        }

        let admission = self.conns.admit(conn.clone(), source, Instant::now());
        match &admission {
            Admission::Accepted { id, evicted } => {
                if let Some(evicted) = evicted {
                    debug!(addr = %evicted, "evicted worst connection");
                }
                debug!(id, addr = %addr, "connection added");
                conn.update_requests();
            }
            Admission::Rejected(reason) => {
                debug!(addr = %addr, ?reason, "connection rejected");
                conn.close();
            }
        }
        self.open_new_conns();
        admission
    }

    fn open_new_conns(&mut self) {
        let want = self.want_data();
        for peer in self.conns.next_dials(want) {
            debug!(addr = %peer.addr, source = ?peer.source, "dialing");
            self.dialer.dial(peer);
        }
    }

    fn update_priorities(&mut self, range: Range<usize>) {
        self.update_priority_ranges(vec![range]);
    }

    fn update_priority_ranges(&mut self, ranges: Vec<Range<usize>>) {
        let mut changed = 0;
        for range in ranges {
            changed += self.scheduler.recompute(range, &self.registry).len();
        }
        if changed > 0 {
            self.conns.update_requests_all();
            self.open_new_conns();
        }
    }

    fn verify_piece(&mut self, index: usize, reply: Reply<Result<(), DomainError>>) {
        let target = match self.registry.piece(index) {
            Ok(piece) if piece.is_hashing() => piece.num_verifies + 2,
            Ok(piece) => piece.num_verifies + 1,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        match self.registry.force_queue(index) {
            Ok(true) => self.verifier.enqueue(index),
            Ok(false) => debug!(piece = index, "re-check deferred until hash lands"),
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        }
        self.verify_waiters.push(VerifyWaiter {
            index,
            target,
            reply,
        });
        self.update_priorities(index..index + 1);
    }

    async fn recheck_completion(&mut self, index: usize) -> Result<bool, DomainError> {
        self.registry.piece(index)?;
        let completion = self.storage.piece(index).completion().await;
        let changed = self.registry.apply_storage_completion(index, completion)?;
        if changed {
            self.update_priorities(index..index + 1);
            self.conns.update_requests_all();
        }
        Ok(changed)
    }

    fn hash_finished(&mut self, index: usize, outcome: HashOutcome) {
        if self.closed {
            return;
        }
        match self.registry.hashed(index, &outcome) {
            Ok(true) => self.verifier.enqueue(index),
            Ok(false) => {}
            Err(e) => {
                warn!(piece = index, error = %e, "digest result for unknown piece");
                return;
            }
        }

        self.conns.piece_hashed(index, outcome.data_correct());
        self.update_priorities(index..index + 1);
        if outcome == HashOutcome::Verified {
            self.conns.update_requests_all();
        }
    }

    fn resolve_verify_waiters(&mut self) {
        let registry = &self.registry;
        let (done, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.verify_waiters)
                .into_iter()
                .partition(|w| {
                    registry
                        .piece(w.index)
                        .map(|p| p.num_verifies >= w.target)
                        .unwrap_or(true)
                });
        self.verify_waiters = waiting;
        for waiter in done {
            let _ = waiter.reply.send(Ok(()));
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.conns.close_all();
        for waiter in self.verify_waiters.drain(..) {
            let _ = waiter.reply.send(Err(DomainError::Closed));
        }
        if let Err(e) = self.storage.close().await {
            warn!(error = %e, "storage close failed");
        }
        self.publish();
        info!(info_hash = %self.info_hash, "torrent closed");
    }

    fn publish(&mut self) {
        self.version += 1;
        let snapshot = self.build_snapshot();
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    fn build_snapshot(&self) -> TorrentSnapshot {
        let pieces = (0..self.registry.num_pieces())
            .map(|index| {
                self.registry
                    .piece_state(index, self.scheduler.effective(index))
            })
            .collect();
        let counters = self.registry.counters();
        let ledger = self.registry.ledger();
        let want_data = self.want_data();

        TorrentSnapshot {
            info_hash: self.info_hash,
            name: self.info.name.clone(),
            geometry: *self.registry.geometry(),
            closed: self.closed,
            pieces,
            stats: TorrentStats {
                active_peers: self.conns.num_active(),
                half_open_peers: self.conns.num_half_open(),
                pending_peers: self.conns.num_reserve(),
                max_established_conns: self.conns.limits().max_established,
                pieces_complete: ledger.pieces_complete(),
                bytes_completed: ledger.bytes_completed(),
                bytes_outstanding: ledger.bytes_outstanding(),
                pieces_hashed_correct: counters.pieces_hashed_correct,
                pieces_hashed_not_correct: counters.pieces_hashed_not_correct,
                hash_failures: counters.hash_failures,
                durability_failures: counters.durability_failures,
                write_failures: counters.write_failures,
                want_peers: self.conns.want_peers(want_data),
                conn_stats: self.conns.totals(),
            },
            connections: self.conns.connections(),
            reader_windows: self.scheduler.reader_windows(),
            version: self.version,
        }
    }
}
