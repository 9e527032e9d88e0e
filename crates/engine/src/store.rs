//! Program storage contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use conveyor_core::ProgramId;

use crate::program::Program;

/// Typed accessor over the persisted programs collection.
///
/// One row per program instance. Programs are never deleted by the engine;
/// retention is an external concern.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    /// Persist a newly created program.
    async fn insert(&self, program: &Program) -> Result<(), ProgramStoreError>;

    /// Load a program by id.
    async fn get(&self, id: ProgramId) -> Result<Option<Program>, ProgramStoreError>;

    /// Persist a new cursor position for an existing program.
    async fn update_cursor(&self, id: ProgramId, cursor: usize) -> Result<(), ProgramStoreError>;
}

/// Program store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProgramStoreError {
    #[error("program not found: {0}")]
    NotFound(ProgramId),
    #[error("program already exists: {0}")]
    AlreadyExists(ProgramId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S> ProgramStore for Arc<S>
where
    S: ProgramStore + ?Sized,
{
    async fn insert(&self, program: &Program) -> Result<(), ProgramStoreError> {
        (**self).insert(program).await
    }

    async fn get(&self, id: ProgramId) -> Result<Option<Program>, ProgramStoreError> {
        (**self).get(id).await
    }

    async fn update_cursor(&self, id: ProgramId, cursor: usize) -> Result<(), ProgramStoreError> {
        (**self).update_cursor(id, cursor).await
    }
}

/// In-memory program store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProgramStore {
    programs: RwLock<HashMap<ProgramId, Program>>,
}

impl InMemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.programs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProgramStore for InMemoryProgramStore {
    async fn insert(&self, program: &Program) -> Result<(), ProgramStoreError> {
        let mut programs = self.programs.write().unwrap();
        if programs.contains_key(&program.id) {
            return Err(ProgramStoreError::AlreadyExists(program.id));
        }
        programs.insert(program.id, program.clone());
        Ok(())
    }

    async fn get(&self, id: ProgramId) -> Result<Option<Program>, ProgramStoreError> {
        let programs = self.programs.read().unwrap();
        Ok(programs.get(&id).cloned())
    }

    async fn update_cursor(&self, id: ProgramId, cursor: usize) -> Result<(), ProgramStoreError> {
        let mut programs = self.programs.write().unwrap();
        let program = programs.get_mut(&id).ok_or(ProgramStoreError::NotFound(id))?;
        program.cursor = cursor;
        program.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Program {
        Program::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryProgramStore::new();
        let program = chain(&["extract", "load"]);

        store.insert(&program).await.unwrap();
        let loaded = store.get(program.id).await.unwrap().unwrap();

        assert_eq!(loaded, program);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryProgramStore::new();
        let program = chain(&["extract"]);

        store.insert(&program).await.unwrap();
        assert!(matches!(
            store.insert(&program).await,
            Err(ProgramStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = InMemoryProgramStore::new();
        assert!(store.get(ProgramId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_cursor_persists() {
        let store = InMemoryProgramStore::new();
        let program = chain(&["extract", "load"]);
        store.insert(&program).await.unwrap();

        store.update_cursor(program.id, 1).await.unwrap();

        let loaded = store.get(program.id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 1);
    }

    #[tokio::test]
    async fn update_cursor_on_missing_program_fails() {
        let store = InMemoryProgramStore::new();
        assert!(matches!(
            store.update_cursor(ProgramId::new(), 1).await,
            Err(ProgramStoreError::NotFound(_))
        ));
    }
}
