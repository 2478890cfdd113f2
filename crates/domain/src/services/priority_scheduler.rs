use crate::entities::{ChunkGeometry, PiecePriority};
use crate::services::piece_registry::PieceRegistry;
use bitvec::prelude::*;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::ops::Range;
use uuid::Uuid;

pub type ReaderId = Uuid;

/// A reader's cursor and the byte region it is confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderCursor {
    pub position: u64,
    pub readahead: u64,
    pub region: (u64, u64),
}

impl ReaderCursor {
    pub fn new(region_start: u64, region_len: u64, readahead: u64) -> Self {
        Self {
            position: region_start,
            readahead,
            region: (region_start, region_start.saturating_add(region_len)),
        }
    }

    pub fn at(mut self, position: u64) -> Self {
        self.position = position;
        self
    }
}

/// Effective piece priorities from explicit requests, reader cursors and
/// completeness. Only pieces whose effective priority changed are reported.
#[derive(Debug)]
pub struct PriorityScheduler {
    geometry: ChunkGeometry,
    readers: HashMap<ReaderId, Range<usize>>,
    now: BitVec,
    readahead: BitVec,
    effective: Vec<PiecePriority>,
}

impl PriorityScheduler {
    pub fn new(geometry: ChunkGeometry) -> Self {
        let num_pieces = geometry.num_pieces();
        Self {
            geometry,
            readers: HashMap::new(),
            now: bitvec![0; num_pieces],
            readahead: bitvec![0; num_pieces],
            effective: vec![PiecePriority::None; num_pieces],
        }
    }

    /// Pieces a reader cursor covers: the one under the position and those
    /// inside its readahead, never beyond the reader's region.
    pub fn reader_pieces(&self, cursor: &ReaderCursor) -> Range<usize> {
        let (start, end) = cursor.region;
        if cursor.position < start || cursor.position >= end {
            return 0..0;
        }
        let len = cursor.readahead.max(1).min(end - cursor.position);
        self.geometry.byte_region_pieces(cursor.position, len)
    }

    /// Insert or move a reader. Returns the piece ranges to recompute.
    pub fn set_reader(&mut self, id: ReaderId, cursor: &ReaderCursor) -> Vec<Range<usize>> {
        let pieces = self.reader_pieces(cursor);
        let previous = self.readers.insert(id, pieces.clone()).unwrap_or(0..0);
        self.rebuild_reader_bits();
        ranges_to_update(previous, pieces)
    }

    pub fn remove_reader(&mut self, id: &ReaderId) -> Vec<Range<usize>> {
        match self.readers.remove(id) {
            Some(previous) => {
                self.rebuild_reader_bits();
                ranges_to_update(previous, 0..0)
            }
            None => Vec::new(),
        }
    }

    pub fn reader_windows(&self) -> Vec<Range<usize>> {
        let mut windows: Vec<Range<usize>> = self
            .readers
            .values()
            .filter(|r| !r.is_empty())
            .cloned()
            .collect();
        windows.sort_by_key(|r| (r.start, r.end));
        windows
    }

    fn rebuild_reader_bits(&mut self) {
        self.now.fill(false);
        self.readahead.fill(false);
        for window in self.readers.values() {
            if window.is_empty() {
                continue;
            }
            self.now.set(window.start, true);
            self.readahead[window.start + 1..window.end].fill(true);
        }
    }

    pub fn compute(&self, index: usize, registry: &PieceRegistry) -> PiecePriority {
        if registry.is_settled(index) {
            return PiecePriority::None;
        }

        let mut priority = PiecePriority::None;
        if self.now.get(index).map(|b| *b).unwrap_or(false) {
            priority.raise(PiecePriority::Now);
        }
        if self.readahead.get(index).map(|b| *b).unwrap_or(false) {
            priority.raise(PiecePriority::Readahead);
        }
        if let Ok(piece) = registry.piece(index) {
            priority.raise(piece.priority);
        }
        priority
    }

    /// Recompute a range and return the indices whose priority changed.
    pub fn recompute(&mut self, range: Range<usize>, registry: &PieceRegistry) -> Vec<usize> {
        let end = range.end.min(self.effective.len());
        let mut changed = Vec::new();
        for index in range.start..end {
            let priority = self.compute(index, registry);
            if self.effective[index] != priority {
                self.effective[index] = priority;
                changed.push(index);
            }
        }
        changed
    }

    pub fn recompute_all(&mut self, registry: &PieceRegistry) -> Vec<usize> {
        self.recompute(0..self.effective.len(), registry)
    }

    pub fn effective(&self, index: usize) -> PiecePriority {
        self.effective
            .get(index)
            .copied()
            .unwrap_or(PiecePriority::None)
    }

    pub fn priorities(&self) -> &[PiecePriority] {
        &self.effective
    }
}

/// Ranges to recompute after a reader window moves from `from` to `to`.
/// Disjoint windows are returned separately, touching or overlapping ones as
/// their union.
pub fn ranges_to_update(from: Range<usize>, to: Range<usize>) -> Vec<Range<usize>> {
    if from == to {
        return Vec::new();
    }
    if from.is_empty() {
        return vec![to];
    }
    if to.is_empty() {
        return vec![from];
    }

    let (low, high) = if from.start <= to.start {
        (from, to)
    } else {
        (to, from)
    };

    if low.end < high.start {
        vec![low, high]
    } else {
        vec![low.start..low.end.max(high.end)]
    }
}

/// A random permutation of piece indices, giving each connection its own
/// tie-break order.
pub fn piece_inclination(num_pieces: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_pieces).collect();
    order.shuffle(&mut rand::thread_rng());
    order
}

/// Wanted pieces, most urgent first; ties follow the inclination.
pub fn request_order(priorities: &[PiecePriority], inclination: &[usize]) -> Vec<usize> {
    let mut rank = vec![usize::MAX; priorities.len()];
    for (position, index) in inclination.iter().enumerate() {
        if let Some(slot) = rank.get_mut(*index) {
            *slot = position;
        }
    }

    let mut wanted: Vec<usize> = (0..priorities.len())
        .filter(|index| priorities[*index].is_wanted())
        .collect();
    wanted.sort_by(|a, b| {
        priorities[*b]
            .cmp(&priorities[*a])
            .then(rank[*a].cmp(&rank[*b]))
            .then(a.cmp(b))
    });
    wanted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ChunkSpec, Completion, TorrentInfo};

    const PIECE: u64 = 100;

    fn setup(num_pieces: usize) -> (PieceRegistry, PriorityScheduler) {
        let data = vec![0u8; num_pieces * PIECE as usize];
        let info = TorrentInfo::from_bytes("sched", PIECE, &data);
        let registry = PieceRegistry::new(&info, 50);
        let scheduler = PriorityScheduler::new(*registry.geometry());
        (registry, scheduler)
    }

    #[test]
    fn ranges_disjoint_and_overlapping() {
        assert_eq!(ranges_to_update(0..3, 10..13), vec![0..3, 10..13]);
        assert_eq!(ranges_to_update(10..13, 0..3), vec![0..3, 10..13]);
        assert_eq!(ranges_to_update(0..3, 2..5), vec![0..5]);
        assert_eq!(ranges_to_update(0..3, 3..6), vec![0..6]);
        assert_eq!(ranges_to_update(0..0, 4..6), vec![4..6]);
        assert_eq!(ranges_to_update(4..6, 4..6), Vec::<Range<usize>>::new());
    }

    #[test]
    fn reader_sets_now_and_readahead() {
        let (registry, mut scheduler) = setup(10);
        let reader = Uuid::new_v4();
        // Cursor at piece 2 with 250 bytes of readahead covers pieces 2..5.
        let cursor = ReaderCursor::new(0, 1000, 250).at(2 * PIECE);
        let ranges = scheduler.set_reader(reader, &cursor);
        assert_eq!(ranges, vec![2..5]);

        let mut changed = Vec::new();
        for range in ranges {
            changed.extend(scheduler.recompute(range, &registry));
        }
        assert_eq!(changed, vec![2, 3, 4]);
        assert_eq!(scheduler.effective(2), PiecePriority::Now);
        assert_eq!(scheduler.effective(3), PiecePriority::Readahead);
        assert_eq!(scheduler.effective(4), PiecePriority::Readahead);
        assert_eq!(scheduler.effective(5), PiecePriority::None);
    }

    #[test]
    fn moving_reader_recomputes_only_affected_pieces() {
        let (registry, mut scheduler) = setup(20);
        let reader = Uuid::new_v4();
        let cursor = ReaderCursor::new(0, 2000, 250);
        for range in scheduler.set_reader(reader, &cursor.at(0)) {
            scheduler.recompute(range, &registry);
        }

        let ranges = scheduler.set_reader(reader, &cursor.at(10 * PIECE));
        assert_eq!(ranges, vec![0..3, 10..13]);
        let recomputed: usize = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(recomputed, 6);

        let mut changed = Vec::new();
        for range in ranges {
            changed.extend(scheduler.recompute(range, &registry));
        }
        assert_eq!(changed, vec![0, 1, 2, 10, 11, 12]);
        assert_eq!(scheduler.effective(0), PiecePriority::None);
        assert_eq!(scheduler.effective(10), PiecePriority::Now);
    }

    #[test]
    fn readahead_is_clipped_to_region() {
        let (_, scheduler) = setup(10);
        let cursor = ReaderCursor::new(0, 350, 1000).at(250);
        assert_eq!(scheduler.reader_pieces(&cursor), 2..4);
        assert_eq!(scheduler.reader_pieces(&cursor.at(350)), 0..0);

        let zero = ReaderCursor::new(0, 1000, 0).at(500);
        assert_eq!(scheduler.reader_pieces(&zero), 5..6);
    }

    #[test]
    fn explicit_priority_and_completion() {
        let (mut registry, mut scheduler) = setup(4);
        registry.set_priority(1, PiecePriority::High).unwrap();
        registry.set_priority(2, PiecePriority::Normal).unwrap();
        registry
            .apply_storage_completion(2, Completion::known(true))
            .unwrap();
        assert_eq!(scheduler.recompute_all(&registry), vec![1]);
        assert_eq!(scheduler.effective(2), PiecePriority::None);

        let reader = Uuid::new_v4();
        scheduler.set_reader(reader, &ReaderCursor::new(0, 400, 1).at(PIECE));
        scheduler.recompute_all(&registry);
        assert_eq!(scheduler.effective(1), PiecePriority::Now);

        // A fully written piece waiting on the verifier is not wanted.
        registry.chunk_written(&ChunkSpec::new(1, 0, 50)).unwrap();
        registry.chunk_written(&ChunkSpec::new(1, 50, 50)).unwrap();
        assert_eq!(scheduler.recompute(1..2, &registry), vec![1]);
        assert_eq!(scheduler.effective(1), PiecePriority::None);

        let ranges = scheduler.remove_reader(&reader);
        assert_eq!(ranges, vec![1..2]);
        assert!(scheduler.reader_windows().is_empty());
    }

    #[test]
    fn request_order_by_priority_then_inclination() {
        let priorities = vec![
            PiecePriority::Normal,
            PiecePriority::None,
            PiecePriority::Now,
            PiecePriority::Normal,
            PiecePriority::Readahead,
        ];
        let inclination = vec![3, 0, 1, 2, 4];
        assert_eq!(request_order(&priorities, &inclination), vec![2, 4, 3, 0]);

        let shuffled = piece_inclination(5);
        let mut sorted = shuffled.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }
}
