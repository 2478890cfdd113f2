use crate::entities::Sha1Hash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Torrent closed")]
    Closed,

    #[error("Piece not found: {0}")]
    PieceNotFound(usize),

    #[error("Invalid chunk: piece {piece} begin {begin} length {length}")]
    InvalidChunk { piece: usize, begin: u32, length: u32 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Repository error: {0}")]
    RepositoryError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::IoError(err.to_string())
    }
}

/// Outcome of a single failed digest attempt. Every variant is recoverable:
/// the piece is reopened and fetched again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("piece {0} not found during digest")]
    NotFound(usize),

    #[error("piece {index} digest mismatch {actual} != {expected}")]
    Mismatch {
        index: usize,
        expected: Sha1Hash,
        actual: Sha1Hash,
    },

    #[error("piece {index} digest failed short read: {read} != {expected}")]
    ShortRead {
        index: usize,
        read: u64,
        expected: u64,
    },

    #[error("piece {index} digest failed: {message}")]
    Read { index: usize, message: String },
}

impl VerifyError {
    pub fn index(&self) -> usize {
        match self {
            VerifyError::NotFound(index) => *index,
            VerifyError::Mismatch { index, .. }
            | VerifyError::ShortRead { index, .. }
            | VerifyError::Read { index, .. } => *index,
        }
    }
}
