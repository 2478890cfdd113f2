use super::torrent::Sha1Hash;
use serde::{Deserialize, Serialize};

/// How urgently a piece is wanted. Ordering matters: `None` is not wanted,
/// `Now` is under a reader's cursor.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum PiecePriority {
    #[default]
    None,
    Normal,
    High,
    Readahead,
    Next,
    Now,
}

impl PiecePriority {
    /// Raise to `other` if it is higher. Returns whether the value changed.
    pub fn raise(&mut self, other: PiecePriority) -> bool {
        if other > *self {
            *self = other;
            return true;
        }
        false
    }

    pub fn is_wanted(&self) -> bool {
        *self != PiecePriority::None
    }

    pub fn status_char(&self) -> &'static str {
        match self {
            PiecePriority::Now => "!",
            PiecePriority::Next => "N",
            PiecePriority::Readahead => "R",
            PiecePriority::High => "H",
            PiecePriority::Normal => ".",
            PiecePriority::None => "",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceStatus {
    #[default]
    Incomplete,
    QueuedForHash,
    Hashing,
    Complete,
}

/// Completion as reported by storage. `ok` is false when storage could not
/// tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub complete: bool,
    pub ok: bool,
}

impl Completion {
    pub fn known(complete: bool) -> Self {
        Self { complete, ok: true }
    }
}

/// Public view of one piece as published in snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceState {
    pub priority: PiecePriority,
    pub completion: Completion,
    pub checking: bool,
    pub partial: bool,
}

/// A run of consecutive pieces sharing the same public state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceStateRun {
    pub state: PieceState,
    pub length: usize,
}

impl PieceStateRun {
    /// Compact form such as `12!P` or `40C`.
    pub fn status_chars(&self) -> String {
        let mut out = format!("{}", self.length);
        out.push_str(self.state.priority.status_char());
        if self.state.checking {
            out.push('H');
        }
        if self.state.partial {
            out.push('P');
        }
        if self.state.completion.complete {
            out.push('C');
        }
        if !self.state.completion.ok {
            out.push('?');
        }
        out
    }
}

pub fn piece_state_runs(states: &[PieceState]) -> Vec<PieceStateRun> {
    let mut runs: Vec<PieceStateRun> = Vec::new();
    for state in states {
        match runs.last_mut() {
            Some(run) if run.state == *state => run.length += 1,
            _ => runs.push(PieceStateRun {
                state: *state,
                length: 1,
            }),
        }
    }
    runs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: usize,
    pub hash: Sha1Hash,
    pub priority: PiecePriority,
    pub status: PieceStatus,
    pub num_verifies: u64,
    pub storage_completion_ok: bool,
    pub hash_failures: u64,
    /// A re-check was requested while the piece was hashing.
    pub rehash: bool,
}

impl Piece {
    pub fn new(index: usize, hash: Sha1Hash) -> Self {
        Self {
            index,
            hash,
            priority: PiecePriority::None,
            status: PieceStatus::Incomplete,
            num_verifies: 0,
            storage_completion_ok: false,
            hash_failures: 0,
            rehash: false,
        }
    }

    pub fn mark_queued(&mut self) {
        self.status = PieceStatus::QueuedForHash;
    }

    pub fn mark_hashing(&mut self) {
        self.status = PieceStatus::Hashing;
    }

    pub fn mark_verified(&mut self, verified: bool) {
        self.num_verifies += 1;
        if verified {
            self.status = PieceStatus::Complete;
        } else {
            self.status = PieceStatus::Incomplete;
            self.hash_failures += 1;
        }
    }

    pub fn mark_incomplete(&mut self) {
        self.status = PieceStatus::Incomplete;
    }

    pub fn is_complete(&self) -> bool {
        self.status == PieceStatus::Complete
    }

    pub fn is_queued(&self) -> bool {
        self.status == PieceStatus::QueuedForHash
    }

    pub fn is_hashing(&self) -> bool {
        self.status == PieceStatus::Hashing
    }

    /// Queued or hashing.
    pub fn is_checking(&self) -> bool {
        self.is_queued() || self.is_hashing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(priority: PiecePriority, complete: bool) -> PieceState {
        PieceState {
            priority,
            completion: Completion::known(complete),
            ..Default::default()
        }
    }

    #[test]
    fn priority_order_and_raise() {
        assert!(PiecePriority::None < PiecePriority::Normal);
        assert!(PiecePriority::High < PiecePriority::Readahead);
        assert!(PiecePriority::Next < PiecePriority::Now);

        let mut p = PiecePriority::Readahead;
        assert!(!p.raise(PiecePriority::Normal));
        assert!(p.raise(PiecePriority::Now));
        assert_eq!(p, PiecePriority::Now);
    }

    #[test]
    fn runs_collapse_equal_states() {
        let states = vec![
            state(PiecePriority::None, true),
            state(PiecePriority::None, true),
            state(PiecePriority::Now, false),
            state(PiecePriority::Readahead, false),
            state(PiecePriority::Readahead, false),
        ];
        let runs = piece_state_runs(&states);
        let chars: Vec<String> = runs.iter().map(|r| r.status_chars()).collect();
        assert_eq!(chars, vec!["2C", "1!", "2R"]);
    }

    #[test]
    fn status_chars_flags() {
        let run = PieceStateRun {
            state: PieceState {
                priority: PiecePriority::Normal,
                completion: Completion::default(),
                checking: true,
                partial: true,
            },
            length: 3,
        };
        assert_eq!(run.status_chars(), "3.HP?");
    }

    #[test]
    fn verification_counts() {
        let mut piece = Piece::new(0, Sha1Hash::default());
        piece.mark_queued();
        assert!(piece.is_checking());
        piece.mark_hashing();
        piece.mark_verified(false);
        assert_eq!(piece.status, PieceStatus::Incomplete);
        assert_eq!((piece.num_verifies, piece.hash_failures), (1, 1));
        piece.mark_verified(true);
        assert!(piece.is_complete());
        assert_eq!(piece.num_verifies, 2);
    }
}
