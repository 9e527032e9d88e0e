//! The program entity: a persisted, ordered chain of job names plus a cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conveyor_core::ProgramId;

/// A persisted job chain.
///
/// `cursor` is the index of the next job to execute; `cursor == jobs.len()`
/// means the chain is complete. The cursor only ever moves forward, and the
/// job list is immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Unique program ID
    pub id: ProgramId,
    /// Ordered job names
    pub jobs: Vec<String>,
    /// Position of the next job to execute
    pub cursor: usize,
    /// When the program was created
    pub created_at: DateTime<Utc>,
    /// When the cursor last moved
    pub updated_at: DateTime<Utc>,
}

impl Program {
    /// Create a new program positioned at its first job.
    ///
    /// Rejecting empty chains is the caller's responsibility; see
    /// [`crate::handler::ProgramHandler::create_program`].
    pub fn new(jobs: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ProgramId::new(),
            jobs,
            cursor: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The job the chain is currently waiting on, or `None` once complete.
    pub fn current_job(&self) -> Option<&str> {
        self.jobs.get(self.cursor).map(String::as_str)
    }

    pub fn is_complete(&self) -> bool {
        self.cursor == self.jobs.len()
    }

    /// Move the cursor past the current job.
    pub fn advance(&mut self) {
        debug_assert!(self.cursor < self.jobs.len());
        self.cursor += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Program {
        Program::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn new_program_points_at_first_job() {
        let program = chain(&["extract", "transform", "load"]);

        assert_eq!(program.cursor, 0);
        assert_eq!(program.current_job(), Some("extract"));
        assert!(!program.is_complete());
    }

    #[test]
    fn advance_walks_the_chain_to_completion() {
        let mut program = chain(&["extract", "load"]);

        program.advance();
        assert_eq!(program.cursor, 1);
        assert_eq!(program.current_job(), Some("load"));

        program.advance();
        assert_eq!(program.cursor, 2);
        assert_eq!(program.current_job(), None);
        assert!(program.is_complete());
    }

    #[test]
    fn advance_touches_updated_at() {
        let mut program = chain(&["only"]);
        let created = program.updated_at;

        program.advance();
        assert!(program.updated_at >= created);
    }
}
