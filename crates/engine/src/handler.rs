//! Program lifecycle and advancement logic.

use tracing::debug;

use conveyor_core::ProgramId;

use crate::program::Program;
use crate::store::{ProgramStore, ProgramStoreError};

/// Outcome of advancing a program past a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advancement {
    /// The chain has more work; this is the next job to run.
    Next(String),
    /// The cursor reached the end of the chain.
    Complete,
}

/// Program lifecycle error.
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    /// Malformed creation request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Referenced program does not exist.
    #[error("program not found: {0}")]
    NotFound(ProgramId),

    /// Completion does not name the job the cursor points at: an
    /// out-of-order or duplicate delivery.
    #[error("sequence mismatch at position {position}: expected {expected:?}, got {got:?}")]
    SequenceMismatch {
        position: usize,
        expected: Option<String>,
        got: String,
    },

    #[error(transparent)]
    Store(#[from] ProgramStoreError),
}

/// Owns program-state transitions: creation and cursor advancement.
#[derive(Debug, Clone)]
pub struct ProgramHandler<S> {
    store: S,
}

impl<S: ProgramStore> ProgramHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persist a new program positioned at its first job.
    ///
    /// Fails with [`ProgramError::InvalidInput`] on an empty chain; nothing
    /// is written in that case.
    pub async fn create_program(&self, job_names: Vec<String>) -> Result<ProgramId, ProgramError> {
        if job_names.is_empty() {
            return Err(ProgramError::InvalidInput(
                "a program requires at least one job".to_string(),
            ));
        }

        let program = Program::new(job_names);
        let id = program.id;
        self.store.insert(&program).await?;

        debug!(program_id = %id, jobs = program.jobs.len(), "program created");
        Ok(id)
    }

    /// Record that `completed_job` finished and move the cursor forward.
    ///
    /// A completion that does not match the job at the cursor fails rather
    /// than advancing, preserving chain ordering; the stored cursor is left
    /// untouched. A store failure after the read also leaves the cursor
    /// untouched, so broker redelivery of the same completion stays valid.
    pub async fn advance(
        &self,
        program_id: ProgramId,
        completed_job: &str,
    ) -> Result<Advancement, ProgramError> {
        let mut program = self
            .store
            .get(program_id)
            .await?
            .ok_or(ProgramError::NotFound(program_id))?;

        if program.current_job() != Some(completed_job) {
            return Err(ProgramError::SequenceMismatch {
                position: program.cursor,
                expected: program.current_job().map(str::to_string),
                got: completed_job.to_string(),
            });
        }

        program.advance();
        self.store.update_cursor(program_id, program.cursor).await?;

        match program.current_job() {
            Some(next) => {
                debug!(program_id = %program_id, next = %next, "program advanced");
                Ok(Advancement::Next(next.to_string()))
            }
            None => {
                debug!(program_id = %program_id, "program advanced to completion");
                Ok(Advancement::Complete)
            }
        }
    }
}
