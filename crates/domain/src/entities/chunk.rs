use super::torrent::{num_pieces, piece_len};
use serde::{Deserialize, Serialize};

/// Default request granularity, 16 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// A sub-range of a piece as requested from and delivered by peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub piece: usize,
    pub begin: u32,
    pub length: u32,
}

impl ChunkSpec {
    pub fn new(piece: usize, begin: u32, length: u32) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }

    pub fn end(&self) -> u64 {
        self.begin as u64 + self.length as u64
    }
}

/// Pure arithmetic over the content layout: piece lengths, chunk counts and
/// chunk boundaries, including the short tails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    pub total_length: u64,
    pub piece_length: u64,
    pub chunk_size: u32,
}

impl ChunkGeometry {
    pub fn new(total_length: u64, piece_length: u64, chunk_size: u32) -> Self {
        Self {
            total_length,
            piece_length,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn num_pieces(&self) -> usize {
        num_pieces(self.total_length, self.piece_length)
    }

    pub fn piece_len(&self, piece: usize) -> u64 {
        piece_len(self.total_length, self.piece_length, piece)
    }

    pub fn piece_offset(&self, piece: usize) -> u64 {
        piece as u64 * self.piece_length
    }

    pub fn num_chunks(&self, piece: usize) -> usize {
        self.piece_len(piece).div_ceil(self.chunk_size as u64) as usize
    }

    /// Length of the final chunk of a piece, short when the piece length is
    /// not a multiple of the chunk size.
    pub fn last_chunk_len(&self, piece: usize) -> u32 {
        let len = self.piece_len(piece);
        if len == 0 {
            return 0;
        }
        match (len % self.chunk_size as u64) as u32 {
            0 => self.chunk_size,
            short => short,
        }
    }

    pub fn chunk_spec(&self, piece: usize, chunk: usize) -> Option<ChunkSpec> {
        let count = self.num_chunks(piece);
        if chunk >= count {
            return None;
        }

        let begin = chunk as u32 * self.chunk_size;
        let length = if chunk == count - 1 {
            self.last_chunk_len(piece)
        } else {
            self.chunk_size
        };
        Some(ChunkSpec::new(piece, begin, length))
    }

    /// Map a delivered range back to its chunk. Only ranges aligned to a
    /// chunk boundary with the exact chunk length are accepted.
    pub fn chunk_index(&self, spec: &ChunkSpec) -> Option<usize> {
        if spec.begin % self.chunk_size != 0 {
            return None;
        }
        let chunk = (spec.begin / self.chunk_size) as usize;
        match self.chunk_spec(spec.piece, chunk) {
            Some(expected) if expected == *spec => Some(chunk),
            _ => None,
        }
    }

    pub fn chunk_specs(&self, piece: usize) -> impl Iterator<Item = ChunkSpec> + '_ {
        (0..self.num_chunks(piece)).filter_map(move |chunk| self.chunk_spec(piece, chunk))
    }

    /// Pieces overlapping `[offset, offset + len)`, clipped to the content.
    pub fn byte_region_pieces(&self, offset: u64, len: u64) -> std::ops::Range<usize> {
        if self.piece_length == 0 || offset >= self.total_length || len == 0 {
            return 0..0;
        }
        let end = offset.saturating_add(len).min(self.total_length);
        let first = (offset / self.piece_length) as usize;
        let last = end.div_ceil(self.piece_length) as usize;
        first..last.min(self.num_pieces())
    }
}
