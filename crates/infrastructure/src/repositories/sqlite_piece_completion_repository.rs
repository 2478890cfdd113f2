use crate::database::{piece_completion, SqlitePool};
use async_trait::async_trait;
use diesel::prelude::*;
use domain::{Completion, DomainError, PieceCompletionRepository, PieceKey};

#[derive(Insertable, Debug)]
#[diesel(table_name = piece_completion)]
struct PieceCompletionModel {
    info_hash: String,
    piece_index: i32,
    complete: bool,
}

impl PieceCompletionModel {
    fn new(key: &PieceKey, complete: bool) -> Result<Self, DomainError> {
        Ok(Self {
            info_hash: key.info_hash.to_hex(),
            piece_index: piece_index(key)?,
            complete,
        })
    }
}

/// The column is a 32-bit INTEGER; larger indices cannot be stored.
fn piece_index(key: &PieceKey) -> Result<i32, DomainError> {
    i32::try_from(key.index).map_err(|_| {
        DomainError::RepositoryError(format!("Piece index {} out of range", key.index))
    })
}

pub struct SqlitePieceCompletionRepository {
    pool: SqlitePool,
}

impl SqlitePieceCompletionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PieceCompletionRepository for SqlitePieceCompletionRepository {
    async fn get(&self, key: PieceKey) -> Result<Completion, DomainError> {
        let piece_index = piece_index(&key)?;
        let mut conn = self
            .pool
            .get()
            .map_err(|e| DomainError::RepositoryError(e.to_string()))?;

        let info_hash = key.info_hash.to_hex();
        let result = tokio::task::spawn_blocking(move || {
            piece_completion::table
                .filter(piece_completion::info_hash.eq(info_hash))
                .filter(piece_completion::piece_index.eq(piece_index))
                .select(piece_completion::complete)
                .first::<bool>(&mut conn)
                .optional()
        })
        .await
        .map_err(|e| DomainError::RepositoryError(e.to_string()))?
        .map_err(|e| DomainError::RepositoryError(e.to_string()))?;

        Ok(match result {
            Some(complete) => Completion::known(complete),
            None => Completion::default(),
        })
    }

    async fn set(&self, key: PieceKey, complete: bool) -> Result<(), DomainError> {
        let row = PieceCompletionModel::new(&key, complete)?;
        let mut conn = self
            .pool
            .get()
            .map_err(|e| DomainError::RepositoryError(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            diesel::replace_into(piece_completion::table)
                .values(&row)
                .execute(&mut conn)
        })
        .await
        .map_err(|e| DomainError::RepositoryError(e.to_string()))?
        .map_err(|e| DomainError::RepositoryError(e.to_string()))?;

        Ok(())
    }
}
