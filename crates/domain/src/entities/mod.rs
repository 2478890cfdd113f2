pub mod chunk;
pub mod peer;
pub mod piece;
pub mod stats;
pub mod torrent;

pub use chunk::*;
pub use peer::*;
pub use piece::*;
pub use stats::*;
pub use torrent::*;
