use crate::entities::{
    ChunkGeometry, ChunkSpec, Completion, Piece, PiecePriority, PieceState, PieceStatus,
    TorrentInfo,
};
use crate::errors::{DomainError, VerifyError};
use crate::services::chunk_ledger::ChunkLedger;
use crate::services::digest_verifier::DigestJob;
use crate::services::pending_writes::{PendingWrites, WriteGuard};
use crate::storage::TorrentStorage;
use tracing::{debug, warn};

/// What a delivered chunk did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New data; `queue_for_hash` is set when it was the last missing chunk.
    Useful { queue_for_hash: bool },
    /// Already written or the piece is complete.
    Wasted,
}

/// Result of one hashing attempt after storage was told about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    Verified,
    /// Digest matched but storage refused to record completion.
    NotDurable(String),
    Failed(VerifyError),
}

impl HashOutcome {
    pub fn data_correct(&self) -> bool {
        !matches!(self, HashOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounters {
    pub pieces_hashed_correct: u64,
    pub pieces_hashed_not_correct: u64,
    pub hash_failures: u64,
    pub durability_failures: u64,
    pub write_failures: u64,
}

/// One entry per piece plus the chunk ledger, driving the verification state
/// machine `Incomplete -> QueuedForHash -> Hashing -> Complete | Incomplete`.
pub struct PieceRegistry {
    pieces: Vec<Piece>,
    writes: Vec<PendingWrites>,
    ledger: ChunkLedger,
    counters: RegistryCounters,
}

impl PieceRegistry {
    pub fn new(info: &TorrentInfo, chunk_size: u32) -> Self {
        let geometry = ChunkGeometry::new(info.total_length, info.piece_length, chunk_size);
        let pieces: Vec<Piece> = info
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| Piece::new(index, *hash))
            .collect();
        let writes = pieces.iter().map(|_| PendingWrites::new()).collect();

        Self {
            pieces,
            writes,
            ledger: ChunkLedger::new(geometry),
            counters: RegistryCounters::default(),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn geometry(&self) -> &ChunkGeometry {
        self.ledger.geometry()
    }

    pub fn ledger(&self) -> &ChunkLedger {
        &self.ledger
    }

    pub fn counters(&self) -> RegistryCounters {
        self.counters
    }

    pub fn piece(&self, index: usize) -> Result<&Piece, DomainError> {
        self.pieces
            .get(index)
            .ok_or(DomainError::PieceNotFound(index))
    }

    fn piece_mut(&mut self, index: usize) -> Result<&mut Piece, DomainError> {
        self.pieces
            .get_mut(index)
            .ok_or(DomainError::PieceNotFound(index))
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.pieces
            .get(index)
            .map(Piece::is_complete)
            .unwrap_or(false)
    }

    /// Complete, or every chunk written and waiting on the verifier.
    pub fn is_settled(&self, index: usize) -> bool {
        self.is_complete(index) || self.ledger.all_chunks_received(index)
    }

    pub fn set_priority(&mut self, index: usize, priority: PiecePriority) -> Result<bool, DomainError> {
        let piece = self.piece_mut(index)?;
        let changed = piece.priority != priority;
        piece.priority = priority;
        Ok(changed)
    }

    pub fn raise_priority(&mut self, index: usize, priority: PiecePriority) -> Result<bool, DomainError> {
        Ok(self.piece_mut(index)?.priority.raise(priority))
    }

    /// Open the pending-write barrier for a chunk about to be stored.
    /// `None` means the chunk is not wanted: the piece is complete, in the
    /// verifier, or the chunk was already written.
    pub fn begin_write(&self, spec: &ChunkSpec) -> Result<Option<WriteGuard>, DomainError> {
        if self.geometry().chunk_index(spec).is_none() {
            return Err(DomainError::InvalidChunk {
                piece: spec.piece,
                begin: spec.begin,
                length: spec.length,
            });
        }
        let piece = self.piece(spec.piece)?;
        if piece.is_complete() || piece.is_checking() || self.ledger.is_received(spec) {
            return Ok(None);
        }
        Ok(Some(self.writes[spec.piece].begin()))
    }

    pub fn pending_writes(&self, index: usize) -> Option<&PendingWrites> {
        self.writes.get(index)
    }

    /// Record a chunk that storage accepted.
    pub fn chunk_written(&mut self, spec: &ChunkSpec) -> Result<ChunkOutcome, DomainError> {
        if self.piece(spec.piece)?.is_complete() {
            return Ok(ChunkOutcome::Wasted);
        }

        if !self.ledger.mark_received(spec)? {
            return Ok(ChunkOutcome::Wasted);
        }

        let queue_for_hash = self.ledger.all_chunks_received(spec.piece)
            && self.queue_for_hash(spec.piece)?;
        Ok(ChunkOutcome::Useful { queue_for_hash })
    }

    pub fn write_failed(&mut self, spec: &ChunkSpec, error: &str) {
        self.counters.write_failures += 1;
        warn!(piece = spec.piece, begin = spec.begin, error, "chunk write failed");
    }

    /// Move a piece to `QueuedForHash` unless it is already on its way
    /// through the verifier. Returns whether the caller must enqueue it.
    pub fn queue_for_hash(&mut self, index: usize) -> Result<bool, DomainError> {
        let piece = self.piece_mut(index)?;
        if piece.is_checking() {
            return Ok(false);
        }
        piece.mark_queued();
        debug!(piece = index, "queued for hash");
        Ok(true)
    }

    /// Queue a piece for an explicit re-check. Returns whether the caller
    /// must enqueue it; a piece hashing right now is flagged and requeued
    /// by [`PieceRegistry::hashed`] once the running hash lands.
    pub fn force_queue(&mut self, index: usize) -> Result<bool, DomainError> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(DomainError::PieceNotFound(index))?;
        self.ledger.set_complete(index, false);
        if piece.is_hashing() {
            piece.rehash = true;
            return Ok(false);
        }
        piece.mark_queued();
        Ok(true)
    }

    /// Hand out a digest job and mark the piece as hashing. A piece already
    /// hashing gets no second job; it is hashed again afterwards instead.
    pub fn start_hashing(
        &mut self,
        index: usize,
        storage: &dyn TorrentStorage,
    ) -> Option<DigestJob> {
        let length = self.geometry().piece_len(index);
        let writes = self.writes.get(index)?.clone();
        let piece = self.pieces.get_mut(index)?;
        if piece.is_hashing() {
            piece.rehash = true;
            return None;
        }
        piece.mark_hashing();

        Some(DigestJob {
            index,
            expected: piece.hash,
            length,
            storage: storage.piece(index),
            writes,
        })
    }

    /// Apply a finished hashing attempt. Returns whether a re-check came in
    /// meanwhile, in which case the piece is queued again and the caller
    /// must enqueue it.
    pub fn hashed(&mut self, index: usize, outcome: &HashOutcome) -> Result<bool, DomainError> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(DomainError::PieceNotFound(index))?;

        // The first hash of a piece with unknown storage completion is an
        // initial check and is not scored.
        let scored = piece.storage_completion_ok;
        piece.storage_completion_ok = true;

        match outcome {
            HashOutcome::Verified => {
                piece.mark_verified(true);
                if scored {
                    self.counters.pieces_hashed_correct += 1;
                }
                self.ledger.set_complete(index, true);
                self.ledger.reopen(index);
                debug!(piece = index, "piece verified");
            }
            HashOutcome::NotDurable(error) => {
                piece.num_verifies += 1;
                piece.mark_incomplete();
                if scored {
                    self.counters.pieces_hashed_correct += 1;
                }
                self.counters.durability_failures += 1;
                self.ledger.set_complete(index, false);
                self.ledger.reopen(index);
                warn!(piece = index, error = %error, "storage rejected piece completion");
            }
            HashOutcome::Failed(error) => {
                piece.mark_verified(false);
                if scored {
                    self.counters.pieces_hashed_not_correct += 1;
                }
                self.counters.hash_failures += 1;
                self.ledger.set_complete(index, false);
                self.ledger.reopen(index);
                warn!(piece = index, error = %error, "piece failed verification");
            }
        }

        if !piece.rehash {
            return Ok(false);
        }
        piece.rehash = false;
        piece.mark_queued();
        self.ledger.set_complete(index, false);
        debug!(piece = index, "requeued for hash");
        Ok(true)
    }

    /// Sync a piece with what storage reports. Pieces in the verifier are
    /// left alone. Returns whether completeness changed.
    pub fn apply_storage_completion(
        &mut self,
        index: usize,
        completion: Completion,
    ) -> Result<bool, DomainError> {
        let piece = self.piece_mut(index)?;
        if piece.is_checking() {
            return Ok(false);
        }

        piece.storage_completion_ok = completion.ok;
        let complete = completion.ok && completion.complete;
        let was_complete = piece.is_complete();
        if complete == was_complete {
            return Ok(false);
        }

        piece.status = if complete {
            PieceStatus::Complete
        } else {
            PieceStatus::Incomplete
        };
        self.ledger.set_complete(index, complete);
        self.ledger.reopen(index);
        if !complete {
            debug!(piece = index, "storage lost piece");
        }
        Ok(true)
    }

    pub fn pending_chunks(&self, index: usize) -> Result<Vec<ChunkSpec>, DomainError> {
        let piece = self.piece(index)?;
        if piece.is_checking() {
            return Ok(Vec::new());
        }
        Ok(self.ledger.pending_chunks(index))
    }

    pub fn piece_state(&self, index: usize, priority: PiecePriority) -> PieceState {
        match self.pieces.get(index) {
            Some(piece) => PieceState {
                priority,
                completion: Completion {
                    complete: piece.is_complete(),
                    ok: piece.storage_completion_ok,
                },
                checking: piece.is_checking(),
                partial: self.ledger.is_partial(index),
            },
            None => PieceState::default(),
        }
    }
}
