//! Infrastructure layer: PostgreSQL program store, Redis Streams queue,
//! configuration and assembly.

pub mod config;
pub mod queue;
pub mod store;

pub use config::{ConfigError, InfraConfig};
pub use queue::RedisStreamsQueue;
pub use store::PostgresProgramStore;

use std::sync::Arc;

use conveyor_engine::{ProgramExecutor, ProgramStoreError, QueueError};

/// Assembly error.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    Database(String),
    #[error(transparent)]
    Store(#[from] ProgramStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Connect the production adapters and assemble a wired executor.
///
/// The engine facade takes its store and queue injected; this is the one
/// place that knows how to build them from configuration.
pub async fn build_executor(
    config: &InfraConfig,
) -> Result<ProgramExecutor<PostgresProgramStore, RedisStreamsQueue>, BuildError> {
    let pool = sqlx::PgPool::connect(&config.database_url)
        .await
        .map_err(|e| BuildError::Database(e.to_string()))?;

    let store = Arc::new(PostgresProgramStore::new(pool, &config.table_name)?);
    let queue = Arc::new(RedisStreamsQueue::new(&config.redis_url)?);

    Ok(ProgramExecutor::new(store, queue, config.queue_name.clone()))
}
