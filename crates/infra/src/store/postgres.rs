//! Postgres-backed program store.
//!
//! One row per program instance in a configurable table:
//!
//! | column        | type        |                                  |
//! |---------------|-------------|----------------------------------|
//! | id            | UUID        | primary key                      |
//! | jobs          | JSONB       | ordered job names                |
//! | current_index | BIGINT      | position of the next job         |
//! | created_at    | TIMESTAMPTZ |                                  |
//! | updated_at    | TIMESTAMPTZ |                                  |
//!
//! Migrations are an external concern; this adapter assumes the table
//! exists. SQLx errors are mapped to `ProgramStoreError`: unique violations
//! (`23505`) become `AlreadyExists`, everything else `Storage`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use conveyor_core::ProgramId;
use conveyor_engine::{Program, ProgramStore, ProgramStoreError};

/// Postgres-backed [`ProgramStore`].
///
/// Uses the SQLx connection pool (thread-safe, `Send + Sync`). The table
/// name comes from configuration; identifiers cannot be bound as query
/// parameters, so the name is validated at construction and interpolated.
#[derive(Debug, Clone)]
pub struct PostgresProgramStore {
    pool: Arc<PgPool>,
    table: String,
}

impl PostgresProgramStore {
    /// Create a store over `pool` writing to `table`.
    ///
    /// Fails if `table` is not a plain identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, ProgramStoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            pool: Arc::new(pool),
            table,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl ProgramStore for PostgresProgramStore {
    #[instrument(skip(self, program), fields(program_id = %program.id, table = %self.table), err)]
    async fn insert(&self, program: &Program) -> Result<(), ProgramStoreError> {
        let jobs = serde_json::to_value(&program.jobs)
            .map_err(|e| ProgramStoreError::Storage(format!("failed to serialize jobs: {e}")))?;

        let sql = format!(
            "INSERT INTO {} (id, jobs, current_index, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5)",
            self.table
        );
        sqlx::query(&sql)
            .bind(program.id.as_uuid())
            .bind(jobs)
            .bind(program.cursor as i64)
            .bind(program.created_at)
            .bind(program.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ProgramStoreError::AlreadyExists(program.id)
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(program_id = %id, table = %self.table), err)]
    async fn get(&self, id: ProgramId) -> Result<Option<Program>, ProgramStoreError> {
        let sql = format!(
            "SELECT id, jobs, current_index, created_at, updated_at FROM {} WHERE id = $1",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => {
                let row = ProgramRow::from_row(&row)?;
                Ok(Some(row.into_program()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(program_id = %id, table = %self.table), err)]
    async fn update_cursor(&self, id: ProgramId, cursor: usize) -> Result<(), ProgramStoreError> {
        let sql = format!(
            "UPDATE {} SET current_index = $2, updated_at = NOW() WHERE id = $1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(cursor as i64)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_cursor", e))?;

        if result.rows_affected() == 0 {
            return Err(ProgramStoreError::NotFound(id));
        }
        Ok(())
    }
}

/// Accept plain identifiers only; the table name is interpolated into SQL.
fn validate_table_name(table: &str) -> Result<(), ProgramStoreError> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ProgramStoreError::Storage(format!(
            "invalid table name: {table:?}"
        )))
    }
}

/// Map SQLx errors to `ProgramStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProgramStoreError {
    ProgramStoreError::Storage(format!("{operation}: {err}"))
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[derive(Debug)]
struct ProgramRow {
    id: uuid::Uuid,
    jobs: serde_json::Value,
    current_index: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProgramRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, ProgramStoreError> {
        let read = |e: sqlx::Error| ProgramStoreError::Storage(format!("failed to read row: {e}"));
        Ok(Self {
            id: row.try_get("id").map_err(read)?,
            jobs: row.try_get("jobs").map_err(read)?,
            current_index: row.try_get("current_index").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
            updated_at: row.try_get("updated_at").map_err(read)?,
        })
    }

    fn into_program(self) -> Result<Program, ProgramStoreError> {
        let jobs: Vec<String> = serde_json::from_value(self.jobs)
            .map_err(|e| ProgramStoreError::Storage(format!("malformed jobs column: {e}")))?;
        Ok(Program {
            id: ProgramId::from_uuid(self.id),
            jobs,
            cursor: self.current_index as usize,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
