//! Message queue adapters.

mod redis_streams;

pub use redis_streams::RedisStreamsQueue;
