//! Per-message unit of work: advance the chain, run what comes next.

use tracing::debug;

use crate::handler::{Advancement, ProgramError, ProgramHandler};
use crate::library::JobLibrary;
use crate::message::{Delivery, JobMessage};
use crate::queue::{MessageQueue, QueueError, QueueManager};
use crate::store::ProgramStore;

/// Message-processing error.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Payload could not be decoded into a completion message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The chain names a job the library does not know.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error(transparent)]
    Program(#[from] ProgramError),

    /// Failure from a user-supplied job body; opaque to the engine.
    #[error("job {job} failed: {source}")]
    Job {
        job: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Publish(QueueError),
}

/// Executes exactly one chain step in response to one message.
///
/// Deciding the next step ([`ProgramHandler`]) is kept separate from
/// performing it: the cursor is persisted before the next job body runs, so
/// a failing job never corrupts chain position. The advancement recorded
/// the *previous* job's completion, not the one about to run.
pub struct ProgramExecutorProcessor<S, Q> {
    handler: ProgramHandler<S>,
    library: JobLibrary,
    queue: QueueManager<Q>,
}

impl<S, Q> ProgramExecutorProcessor<S, Q>
where
    S: ProgramStore,
    Q: MessageQueue,
{
    pub fn new(handler: ProgramHandler<S>, library: JobLibrary, queue: QueueManager<Q>) -> Self {
        Self {
            handler,
            library,
            queue,
        }
    }

    /// Advance the program named in `delivery` and run its next job.
    ///
    /// On success of the job body, publishes the trigger for that job name;
    /// a completed chain publishes nothing. Every failure propagates
    /// unchanged; classification is the facade's concern.
    pub async fn process(&self, delivery: &Delivery) -> Result<(), ProcessError> {
        let message = JobMessage::decode(delivery.payload())
            .map_err(|e| ProcessError::MalformedMessage(e.to_string()))?;

        let next = match self
            .handler
            .advance(message.program_id(), message.job())
            .await?
        {
            Advancement::Complete => {
                debug!(program_id = %message.program_id(), "program complete");
                return Ok(());
            }
            Advancement::Next(next) => next,
        };

        let job = self
            .library
            .resolve(&next)
            .ok_or_else(|| ProcessError::UnknownJob(next.clone()))?;

        job.run(message.program_id())
            .await
            .map_err(|source| ProcessError::Job {
                job: next.clone(),
                source,
            })?;

        debug!(program_id = %message.program_id(), job = %next, "job finished, publishing trigger");
        self.queue
            .publish_trigger(&JobMessage::new(message.program_id(), next))
            .await
            .map_err(ProcessError::Publish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use conveyor_core::ProgramId;

    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryProgramStore;

    struct Fixture {
        store: Arc<InMemoryProgramStore>,
        queue: Arc<InMemoryQueue>,
        processor: ProgramExecutorProcessor<Arc<InMemoryProgramStore>, Arc<InMemoryQueue>>,
        runs: Arc<AtomicUsize>,
    }

    /// Store + queue + a processor whose library counts runs of
    /// `transform`/`load` and fails `broken`.
    fn fixture() -> Fixture {
        let store = InMemoryProgramStore::arc();
        let queue = InMemoryQueue::arc();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut library = JobLibrary::new();
        for name in ["transform", "load"] {
            let runs_in_job = Arc::clone(&runs);
            library.register_fn(name, move |_id| {
                let runs = Arc::clone(&runs_in_job);
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }
        library.register_fn("broken", |_id| {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        });

        let processor = ProgramExecutorProcessor::new(
            ProgramHandler::new(store.clone()),
            library,
            QueueManager::new(queue.clone(), "programs"),
        );

        Fixture {
            store,
            queue,
            processor,
            runs,
        }
    }

    async fn create(fix: &Fixture, jobs: &[&str]) -> ProgramId {
        ProgramHandler::new(fix.store.clone())
            .create_program(jobs.iter().map(|s| s.to_string()).collect())
            .await
            .unwrap()
    }

    fn completion(id: ProgramId, job: &str) -> Delivery {
        Delivery::new(JobMessage::new(id, job).encode().unwrap())
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let fix = fixture();

        let err = fix
            .processor
            .process(&Delivery::new("{not json"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::MalformedMessage(_)));
    }

    #[tokio::test]
    async fn runs_next_job_and_publishes_its_trigger() {
        let fix = fixture();
        let id = create(&fix, &["extract", "transform"]).await;

        fix.processor
            .process(&completion(id, "extract"))
            .await
            .unwrap();

        assert_eq!(fix.runs.load(Ordering::SeqCst), 1);
        let published = fix.queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(
            JobMessage::decode(&published[0].1).unwrap(),
            JobMessage::new(id, "transform")
        );
    }

    #[tokio::test]
    async fn completed_chain_publishes_nothing() {
        let fix = fixture();
        let id = create(&fix, &["extract"]).await;

        fix.processor
            .process(&completion(id, "extract"))
            .await
            .unwrap();

        assert!(fix.queue.published().is_empty());
        assert_eq!(fix.store.get(id).await.unwrap().unwrap().cursor, 1);
    }

    #[tokio::test]
    async fn unknown_next_job_is_rejected() {
        let fix = fixture();
        let id = create(&fix, &["extract", "unregistered"]).await;

        let err = fix
            .processor
            .process(&completion(id, "extract"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::UnknownJob(name) if name == "unregistered"));
        // The advancement itself stands: the cursor recorded `extract`.
        assert_eq!(fix.store.get(id).await.unwrap().unwrap().cursor, 1);
    }

    #[tokio::test]
    async fn job_failure_propagates_without_a_publish() {
        let fix = fixture();
        let id = create(&fix, &["extract", "broken"]).await;

        let err = fix
            .processor
            .process(&completion(id, "extract"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Job { ref job, .. } if job == "broken"));
        assert!(fix.queue.published().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_completion_is_rejected() {
        let fix = fixture();
        let id = create(&fix, &["extract", "transform"]).await;

        let err = fix
            .processor
            .process(&completion(id, "transform"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProcessError::Program(ProgramError::SequenceMismatch { .. })
        ));
        assert!(fix.queue.published().is_empty());
    }
}
