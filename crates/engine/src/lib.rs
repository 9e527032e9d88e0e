//! `conveyor-engine` — the program-advancement engine.
//!
//! A *program* is a persisted, ordered chain of job names plus a cursor.
//! The engine drives chains forward one queue message at a time: each
//! inbound message reports a finished job; the engine validates it against
//! the cursor, persists the new position, runs the next job and publishes
//! its trigger.
//!
//! Storage and transport live behind the [`store::ProgramStore`] and
//! [`queue::MessageQueue`] traits; in-memory implementations ship here for
//! tests/dev, production adapters live in `conveyor-infra`.

pub mod executor;
pub mod handler;
pub mod library;
pub mod message;
pub mod processor;
pub mod program;
pub mod queue;
pub mod store;

pub use executor::{ErrorListener, PREFETCH_COUNT, ProgramExecutor, RETRY_TIME};
pub use handler::{Advancement, ProgramError, ProgramHandler};
pub use library::{Job, JobFuture, JobLibrary};
pub use message::{Delivery, JobMessage};
pub use processor::{ProcessError, ProgramExecutorProcessor};
pub use program::Program;
pub use queue::{
    ConsumerError, ConsumerOptions, HandlerFuture, InMemoryQueue, MAX_BROKER_ERROR_LEN,
    MessageHandler, MessageQueue, QueueError, QueueManager,
};
pub use store::{InMemoryProgramStore, ProgramStore, ProgramStoreError};
