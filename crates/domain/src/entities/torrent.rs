use crate::errors::DomainError;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HASH_LEN: usize = 20;

/// A 20-byte SHA-1 digest. Used both as the torrent's info hash and as the
/// expected digest of every piece.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sha1Hash(pub [u8; HASH_LEN]);

pub type InfoHash = Sha1Hash;

impl Sha1Hash {
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    pub fn from_hex(value: &str) -> Result<Self, DomainError> {
        let bytes = hex::decode(value)
            .map_err(|e| DomainError::ParseError(format!("Invalid hash {}: {}", value, e)))?;
        let array: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| DomainError::ParseError(format!("Hash must be {} bytes", HASH_LEN)))?;
        Ok(Self(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", self.to_hex())
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Static description of the shared content: how it is cut into pieces and
/// what every piece must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub total_length: u64,
    pub pieces: Vec<Sha1Hash>,
}

impl TorrentInfo {
    pub fn new(
        name: String,
        piece_length: u64,
        total_length: u64,
        pieces: Vec<Sha1Hash>,
    ) -> Result<Self, DomainError> {
        if piece_length == 0 && total_length > 0 {
            return Err(DomainError::ValidationError(format!(
                "Piece length must be non-zero for {} bytes",
                total_length
            )));
        }
        let expected = num_pieces(total_length, piece_length);
        if pieces.len() != expected {
            return Err(DomainError::ValidationError(format!(
                "{} piece hashes for {} bytes at piece length {}, expected {}",
                pieces.len(),
                total_length,
                piece_length,
                expected
            )));
        }

        Ok(Self {
            name,
            piece_length,
            total_length,
            pieces,
        })
    }

    /// Hash in-memory content into a torrent description.
    pub fn from_bytes(name: impl Into<String>, piece_length: u64, data: &[u8]) -> Self {
        let pieces = if piece_length == 0 {
            Vec::new()
        } else {
            data.chunks(piece_length as usize)
                .map(Sha1Hash::digest)
                .collect()
        };

        Self {
            name: name.into(),
            piece_length,
            total_length: data.len() as u64,
            pieces,
        }
    }

    /// Hash streamed content into a torrent description, one piece at a time.
    pub async fn from_reader<R>(
        name: impl Into<String>,
        piece_length: u64,
        mut reader: R,
    ) -> Result<Self, DomainError>
    where
        R: AsyncRead + Unpin,
    {
        if piece_length == 0 {
            return Err(DomainError::ValidationError(
                "Piece length must be non-zero".to_string(),
            ));
        }

        let mut pieces = Vec::new();
        let mut total_length = 0u64;
        let mut buffer = vec![0u8; piece_length as usize];

        loop {
            let mut filled = 0;
            while filled < buffer.len() {
                let n = reader.read(&mut buffer[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }

            if filled == 0 {
                break;
            }

            pieces.push(Sha1Hash::digest(&buffer[..filled]));
            total_length += filled as u64;

            if filled < buffer.len() {
                break;
            }
        }

        Ok(Self {
            name: name.into(),
            piece_length,
            total_length,
            pieces,
        })
    }

    /// Identity of the content: SHA-1 over the name, the lengths and every
    /// piece digest.
    pub fn info_hash(&self) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.piece_length.to_be_bytes());
        hasher.update(self.total_length.to_be_bytes());
        for piece in &self.pieces {
            hasher.update(piece.as_bytes());
        }
        Sha1Hash(hasher.finalize().into())
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of a piece; the last piece carries the remainder.
    pub fn piece_len(&self, index: usize) -> u64 {
        piece_len(self.total_length, self.piece_length, index)
    }

    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }

    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        self.pieces.get(index).copied()
    }
}

pub(crate) fn num_pieces(total_length: u64, piece_length: u64) -> usize {
    if piece_length == 0 {
        return 0;
    }
    total_length.div_ceil(piece_length) as usize
}

pub(crate) fn piece_len(total_length: u64, piece_length: u64, index: usize) -> u64 {
    let count = num_pieces(total_length, piece_length);
    if index >= count {
        return 0;
    }

    if index == count - 1 {
        let remainder = total_length % piece_length;
        if remainder != 0 {
            return remainder;
        }
    }
    piece_length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_splits_pieces() {
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let info = TorrentInfo::from_bytes("sample", 100, &data);
        assert_eq!(info.num_pieces(), 3);
        assert_eq!(info.piece_len(0), 100);
        assert_eq!(info.piece_len(2), 50);
        assert_eq!(info.piece_hash(2), Some(Sha1Hash::digest(&data[200..])));
    }

    #[test]
    fn exact_multiple_has_full_last_piece() {
        let info = TorrentInfo::from_bytes("even", 100, &[7u8; 300]);
        assert_eq!(info.num_pieces(), 3);
        assert_eq!(info.piece_len(2), 100);
    }

    #[test]
    fn zero_length_content_has_no_pieces() {
        let info = TorrentInfo::from_bytes("empty", 100, &[]);
        assert_eq!(info.num_pieces(), 0);
        assert_eq!(info.piece_len(0), 0);

        let degenerate = TorrentInfo::from_bytes("degenerate", 0, &[1, 2, 3]);
        assert_eq!(degenerate.num_pieces(), 0);
    }

    #[test]
    fn new_rejects_wrong_piece_count() {
        let err = TorrentInfo::new("bad".to_string(), 100, 250, vec![Sha1Hash::default()]);
        assert!(matches!(err, Err(DomainError::ValidationError(_))));
    }

    #[test]
    fn new_rejects_zero_piece_length_with_content() {
        let err = TorrentInfo::new("flat".to_string(), 0, 3, Vec::new());
        assert!(matches!(err, Err(DomainError::ValidationError(_))));
        assert!(TorrentInfo::new("empty".to_string(), 0, 0, Vec::new()).is_ok());
    }

    #[tokio::test]
    async fn from_reader_matches_from_bytes() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let streamed = TorrentInfo::from_reader("sample", 128, &data[..]).await.unwrap();
        assert_eq!(streamed, TorrentInfo::from_bytes("sample", 128, &data));
        assert_eq!(streamed.info_hash(), TorrentInfo::from_bytes("sample", 128, &data).info_hash());
    }

    #[test]
    fn hex_parsing() {
        let hash = Sha1Hash::digest(b"abc");
        assert_eq!(Sha1Hash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(Sha1Hash::from_hex("abcd").is_err());
    }
}
