//! Top-level facade: program creation, consumer registration, failure policy.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use conveyor_core::ProgramId;

use crate::handler::{ProgramError, ProgramHandler};
use crate::library::JobLibrary;
use crate::message::Delivery;
use crate::processor::{ProcessError, ProgramExecutorProcessor};
use crate::queue::{
    ConsumerError, ConsumerOptions, MessageHandler, MessageQueue, QueueError, QueueManager,
};
use crate::store::ProgramStore;

/// Redelivery delay the broker applies when a message handler fails.
pub const RETRY_TIME: Duration = Duration::from_secs(60);

/// One in-flight message per consumer; chain ordering depends on it.
pub const PREFETCH_COUNT: u16 = 1;

/// Observer invoked with the full, untruncated failure and the original
/// inbound payload.
pub type ErrorListener = Box<dyn Fn(&ProcessError, &Delivery) + Send + Sync>;

/// Facade over the program-advancement engine.
///
/// Owns the failure-containment policy: a failing message callback first
/// notifies every registered error listener with the original error and the
/// original delivery, then hands the broker a bounded error derived from it.
/// The two channels are independent: a missing listener never suppresses
/// the bounded error, and listeners never alter it.
///
/// No state persists across messages here; all durable state lives in
/// program rows.
pub struct ProgramExecutor<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    queue_name: String,
    listeners: Arc<RwLock<Vec<ErrorListener>>>,
}

impl<S, Q> ProgramExecutor<S, Q>
where
    S: ProgramStore + 'static,
    Q: MessageQueue + 'static,
{
    /// Build a facade over an injected store and queue.
    pub fn new(store: Arc<S>, queue: Arc<Q>, queue_name: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            queue_name: queue_name.into(),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Register an observer for processing failures.
    pub fn on_program_error(
        &self,
        listener: impl Fn(&ProcessError, &Delivery) + Send + Sync + 'static,
    ) {
        self.listeners.write().unwrap().push(Box::new(listener));
    }

    /// Create a new program from an ordered list of job names.
    ///
    /// One store write; returns the created identifier.
    pub async fn create_program(&self, job_names: Vec<String>) -> Result<ProgramId, ProgramError> {
        ProgramHandler::new(Arc::clone(&self.store))
            .create_program(job_names)
            .await
    }

    /// Register the queue consumer and start pulling messages.
    ///
    /// Consumes with a prefetch of one: two completions for the same program
    /// are never processed concurrently, which would race on the cursor.
    /// The consumer is pulling by the time this returns.
    pub async fn process_programs(&self, library: JobLibrary) -> Result<(), QueueError> {
        let manager = QueueManager::new(Arc::clone(&self.queue), self.queue_name.clone());
        let options = ConsumerOptions {
            channel: self.queue_name.clone(),
            logger: manager.consumer_logger(),
            prefetch_count: PREFETCH_COUNT,
            retry_time: RETRY_TIME,
        };

        let processor = Arc::new(ProgramExecutorProcessor::new(
            ProgramHandler::new(Arc::clone(&self.store)),
            library,
            manager,
        ));
        let listeners = Arc::clone(&self.listeners);

        info!(queue = %options.channel, logger = %options.logger, "starting program consumer");

        let on_message: MessageHandler = Arc::new(move |delivery: Delivery| {
            let processor = Arc::clone(&processor);
            let listeners = Arc::clone(&listeners);
            Box::pin(async move {
                match processor.process(&delivery).await {
                    Ok(()) => Ok(()),
                    Err(error) => {
                        warn!(error = %error, "program step failed");
                        for listener in listeners.read().unwrap().iter() {
                            listener(&error, &delivery);
                        }
                        Err(ConsumerError::bounded(error.to_string()))
                    }
                }
            })
        });

        self.queue.consume(options, on_message).await
    }
}
