pub mod chunk_ledger;
pub mod connection_manager;
pub mod digest_verifier;
pub mod peer_pool;
pub mod pending_writes;
pub mod piece_registry;
pub mod priority_scheduler;
pub mod reader;
pub mod torrent_service;

pub use chunk_ledger::ChunkLedger;
pub use connection_manager::{
    Admission, ChannelDialer, ConnectionId, ConnectionInfo, ConnectionLimits, ConnectionManager,
    Dialer, PeerConnection, RejectReason,
};
pub use digest_verifier::{DigestJob, DigestTarget, DigestVerifier};
pub use peer_pool::PeerPool;
pub use pending_writes::{PendingWrites, WriteEpoch, WriteGuard};
pub use piece_registry::{ChunkOutcome, HashOutcome, PieceRegistry, RegistryCounters};
pub use priority_scheduler::{PriorityScheduler, ReaderCursor, ReaderId};
pub use reader::Reader;
pub use torrent_service::{
    TorrentHandle, TorrentOptions, TorrentService, TorrentSnapshot, DEFAULT_READAHEAD,
};
