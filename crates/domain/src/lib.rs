pub mod entities;
pub mod errors;
pub mod repositories;
pub mod services;
pub mod storage;

pub use entities::*;
pub use errors::*;
pub use repositories::*;
pub use services::*;
pub use storage::{MemoryStorage, PieceStorage, TorrentStorage};
