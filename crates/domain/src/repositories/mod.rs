pub mod piece_completion_repository;

pub use piece_completion_repository::{MemoryPieceCompletion, PieceCompletionRepository, PieceKey};
