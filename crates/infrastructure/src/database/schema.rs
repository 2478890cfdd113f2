// Persisted piece completion, keyed by torrent and piece
diesel::table! {
    piece_completion (info_hash, piece_index) {
        info_hash -> Text,         // hex SHA1 of the torrent info
        piece_index -> Integer,
        complete -> Bool,
    }
}
