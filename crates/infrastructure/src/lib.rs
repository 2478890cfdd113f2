pub mod database;
pub mod repositories;
pub mod storage;

pub use database::{Database, SqlitePool};
pub use repositories::SqlitePieceCompletionRepository;
pub use storage::FileStorage;
