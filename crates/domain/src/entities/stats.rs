use serde::{Deserialize, Serialize};

/// Per-connection transfer accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnStats {
    pub chunks_read_useful: u64,
    pub chunks_read_wasted: u64,
    pub bytes_read_useful: u64,
    pub bytes_read_wasted: u64,
    pub pieces_dirtied_good: u64,
    pub pieces_dirtied_bad: u64,
}

impl ConnStats {
    pub fn add(&mut self, other: &ConnStats) {
        self.chunks_read_useful += other.chunks_read_useful;
        self.chunks_read_wasted += other.chunks_read_wasted;
        self.bytes_read_useful += other.bytes_read_useful;
        self.bytes_read_wasted += other.bytes_read_wasted;
        self.pieces_dirtied_good += other.pieces_dirtied_good;
        self.pieces_dirtied_bad += other.pieces_dirtied_bad;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentStats {
    pub active_peers: usize,
    pub half_open_peers: usize,
    pub pending_peers: usize,
    pub max_established_conns: usize,
    pub pieces_complete: usize,
    pub bytes_completed: u64,
    pub bytes_outstanding: u64,
    pub pieces_hashed_correct: u64,
    pub pieces_hashed_not_correct: u64,
    pub hash_failures: u64,
    pub durability_failures: u64,
    pub write_failures: u64,
    pub want_peers: bool,
    pub conn_stats: ConnStats,
}
