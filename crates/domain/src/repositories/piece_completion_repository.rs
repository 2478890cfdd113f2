use crate::entities::{Completion, InfoHash};
use crate::errors::DomainError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceKey {
    pub info_hash: InfoHash,
    pub index: usize,
}

impl PieceKey {
    pub fn new(info_hash: InfoHash, index: usize) -> Self {
        Self { info_hash, index }
    }
}

/// Persisted piece completion, so verified pieces survive a restart.
#[async_trait]
pub trait PieceCompletionRepository: Send + Sync {
    async fn get(&self, key: PieceKey) -> Result<Completion, DomainError>;
    async fn set(&self, key: PieceKey, complete: bool) -> Result<(), DomainError>;
}

/// Process-local completion store. Unknown keys report `ok == false`.
#[derive(Debug, Default)]
pub struct MemoryPieceCompletion {
    entries: Mutex<HashMap<PieceKey, bool>>,
}

impl MemoryPieceCompletion {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PieceCompletionRepository for MemoryPieceCompletion {
    async fn get(&self, key: PieceKey) -> Result<Completion, DomainError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| DomainError::RepositoryError(e.to_string()))?;
        Ok(match entries.get(&key) {
            Some(complete) => Completion::known(*complete),
            None => Completion::default(),
        })
    }

    async fn set(&self, key: PieceKey, complete: bool) -> Result<(), DomainError> {
        self.entries
            .lock()
            .map_err(|e| DomainError::RepositoryError(e.to_string()))?
            .insert(key, complete);
        Ok(())
    }
}
