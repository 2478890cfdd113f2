use crate::entities::{ChunkGeometry, ChunkSpec};
use crate::errors::DomainError;
use bitvec::prelude::*;

/// Tracks which chunks of each piece have been written and await
/// verification, plus which pieces are already complete.
#[derive(Debug, Clone)]
pub struct ChunkLedger {
    geometry: ChunkGeometry,
    dirty: Vec<BitVec>,
    complete: BitVec,
}

impl ChunkLedger {
    pub fn new(geometry: ChunkGeometry) -> Self {
        let num_pieces = geometry.num_pieces();
        let dirty = (0..num_pieces)
            .map(|piece| bitvec![0; geometry.num_chunks(piece)])
            .collect();

        Self {
            geometry,
            dirty,
            complete: bitvec![0; num_pieces],
        }
    }

    pub fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    /// Set the dirty bit of a delivered chunk. Returns `true` when the bit
    /// was not already set.
    pub fn mark_received(&mut self, spec: &ChunkSpec) -> Result<bool, DomainError> {
        let chunk = self
            .geometry
            .chunk_index(spec)
            .ok_or(DomainError::InvalidChunk {
                piece: spec.piece,
                begin: spec.begin,
                length: spec.length,
            })?;

        let bits = &mut self.dirty[spec.piece];
        let was_set = bits[chunk];
        bits.set(chunk, true);
        Ok(!was_set)
    }

    pub fn is_received(&self, spec: &ChunkSpec) -> bool {
        match self.geometry.chunk_index(spec) {
            Some(chunk) => self.dirty[spec.piece][chunk],
            None => false,
        }
    }

    pub fn all_chunks_received(&self, piece: usize) -> bool {
        match self.dirty.get(piece) {
            Some(bits) => !bits.is_empty() && bits.all(),
            None => false,
        }
    }

    /// Some but not all chunks written.
    pub fn is_partial(&self, piece: usize) -> bool {
        match self.dirty.get(piece) {
            Some(bits) => bits.any() && !bits.all(),
            None => false,
        }
    }

    pub fn reopen(&mut self, piece: usize) {
        if let Some(bits) = self.dirty.get_mut(piece) {
            bits.fill(false);
        }
    }

    pub fn set_complete(&mut self, piece: usize, complete: bool) {
        if piece < self.complete.len() {
            self.complete.set(piece, complete);
        }
    }

    pub fn is_complete(&self, piece: usize) -> bool {
        self.complete.get(piece).map(|bit| *bit).unwrap_or(false)
    }

    pub fn pieces_complete(&self) -> usize {
        self.complete.count_ones()
    }

    /// Chunks of a piece that still have to be fetched.
    pub fn pending_chunks(&self, piece: usize) -> Vec<ChunkSpec> {
        if self.is_complete(piece) {
            return Vec::new();
        }
        match self.dirty.get(piece) {
            Some(bits) => bits
                .iter_zeros()
                .filter_map(|chunk| self.geometry.chunk_spec(piece, chunk))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn dirty_bytes(&self, piece: usize) -> u64 {
        let Some(bits) = self.dirty.get(piece) else {
            return 0;
        };
        let count = bits.count_ones() as u64;
        if count == 0 {
            return 0;
        }

        let last = bits.len() - 1;
        let chunk_size = self.geometry.chunk_size as u64;
        if bits[last] {
            (count - 1) * chunk_size + self.geometry.last_chunk_len(piece) as u64
        } else {
            count * chunk_size
        }
    }

    pub fn bytes_completed(&self) -> u64 {
        self.complete
            .iter_ones()
            .map(|piece| self.geometry.piece_len(piece))
            .sum()
    }

    /// Bytes neither verified nor written pending verification.
    pub fn bytes_outstanding(&self) -> u64 {
        let dirty: u64 = (0..self.dirty.len())
            .filter(|piece| !self.is_complete(*piece))
            .map(|piece| self.dirty_bytes(piece))
            .sum();
        self.geometry
            .total_length
            .saturating_sub(self.bytes_completed())
            .saturating_sub(dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u32 = 1024;

    fn ledger() -> ChunkLedger {
        // Pieces of 40 KiB over 90 KiB: chunks 16+16+8, 16+16+8, 10.
        ChunkLedger::new(ChunkGeometry::new(90 * KIB as u64, 40 * KIB as u64, 16 * KIB))
    }

    #[test]
    fn mark_received_is_idempotent() {
        let mut ledger = ledger();
        let spec = ChunkSpec::new(0, 0, 16 * KIB);
        assert!(ledger.mark_received(&spec).unwrap());
        let outstanding = ledger.bytes_outstanding();
        assert!(!ledger.mark_received(&spec).unwrap());
        assert_eq!(ledger.bytes_outstanding(), outstanding);
        assert!(ledger.is_received(&spec));
        assert!(ledger.is_partial(0));
    }

    #[test]
    fn last_chunk_completes_piece() {
        let mut ledger = ledger();
        ledger.mark_received(&ChunkSpec::new(0, 0, 16 * KIB)).unwrap();
        ledger.mark_received(&ChunkSpec::new(0, 16 * KIB, 16 * KIB)).unwrap();
        assert!(!ledger.all_chunks_received(0));
        assert_eq!(ledger.pending_chunks(0), vec![ChunkSpec::new(0, 32 * KIB, 8 * KIB)]);

        ledger.mark_received(&ChunkSpec::new(0, 32 * KIB, 8 * KIB)).unwrap();
        assert!(ledger.all_chunks_received(0));
        assert!(!ledger.is_partial(0));
        assert_eq!(ledger.dirty_bytes(0), 40 * KIB as u64);
    }

    #[test]
    fn short_last_piece_single_chunk() {
        let mut ledger = ledger();
        assert!(ledger
            .mark_received(&ChunkSpec::new(2, 0, 16 * KIB))
            .is_err());
        ledger.mark_received(&ChunkSpec::new(2, 0, 10 * KIB)).unwrap();
        assert!(ledger.all_chunks_received(2));
        assert_eq!(ledger.bytes_outstanding(), 80 * KIB as u64);
    }

    #[test]
    fn out_of_range_chunk_is_rejected() {
        let mut ledger = ledger();
        let err = ledger.mark_received(&ChunkSpec::new(7, 0, 16 * KIB));
        assert!(matches!(err, Err(DomainError::InvalidChunk { piece: 7, .. })));
    }

    #[test]
    fn outstanding_accounts_for_complete_and_dirty() {
        let mut ledger = ledger();
        assert_eq!(ledger.bytes_outstanding(), 90 * KIB as u64);

        ledger.set_complete(1, true);
        assert_eq!(ledger.bytes_completed(), 40 * KIB as u64);
        ledger.mark_received(&ChunkSpec::new(0, 32 * KIB, 8 * KIB)).unwrap();
        assert_eq!(ledger.bytes_outstanding(), 42 * KIB as u64);

        ledger.reopen(0);
        assert_eq!(ledger.bytes_outstanding(), 50 * KIB as u64);
        assert!(ledger.pending_chunks(1).is_empty());
    }

    #[test]
    fn empty_torrent() {
        let ledger = ChunkLedger::new(ChunkGeometry::new(0, 16 * KIB as u64, 16 * KIB));
        assert_eq!(ledger.bytes_outstanding(), 0);
        assert!(!ledger.all_chunks_received(0));
    }
}
