//! Environment-driven configuration for the infrastructure adapters.

use serde::Deserialize;

/// Default name of the persisted-programs table.
pub const DEFAULT_TABLE: &str = "programs";

/// Default queue name; also seeds the `<queue>-consumer` logger identity.
pub const DEFAULT_QUEUE: &str = "programs";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(&'static str),
}

/// Connection and naming configuration for the production adapters.
///
/// Connection URLs are passed through opaquely to sqlx/redis.
#[derive(Debug, Clone, Deserialize)]
pub struct InfraConfig {
    pub database_url: String,
    pub redis_url: String,
    pub table_name: String,
    pub queue_name: String,
}

impl InfraConfig {
    /// Load from the environment.
    ///
    /// `CONVEYOR_DATABASE_URL` and `CONVEYOR_REDIS_URL` are required;
    /// `CONVEYOR_TABLE` and `CONVEYOR_QUEUE` fall back to `programs`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("CONVEYOR_DATABASE_URL")?,
            redis_url: require("CONVEYOR_REDIS_URL")?,
            table_name: std::env::var("CONVEYOR_TABLE")
                .unwrap_or_else(|_| DEFAULT_TABLE.to_string()),
            queue_name: std::env::var("CONVEYOR_QUEUE")
                .unwrap_or_else(|_| DEFAULT_QUEUE.to_string()),
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variables_are_reported_by_name() {
        let err = require("CONVEYOR_TEST_SURELY_UNSET").unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("CONVEYOR_TEST_SURELY_UNSET"));
    }
}
