pub mod sqlite_piece_completion_repository;

pub use sqlite_piece_completion_repository::SqlitePieceCompletionRepository;
