//! Message-broker contract: publish, consumer registration, bounded errors.
//!
//! The broker client is an external collaborator. Channel setup,
//! acknowledgement, prefetch and redelivery mechanics live behind
//! [`MessageQueue`]; implementations ack a delivery when the handler returns
//! `Ok` and schedule redelivery after [`ConsumerOptions::retry_time`] when it
//! returns `Err`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::message::{Delivery, JobMessage};

/// Longest error message the broker layer will ever be handed.
///
/// Downstream log aggregators split longer lines, destroying stack context.
pub const MAX_BROKER_ERROR_LEN: usize = 255;

/// Error a message handler returns to the broker layer.
///
/// Carries a bounded message only; the full failure detail travels through
/// the executor's error listeners instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ConsumerError {
    message: String,
}

impl ConsumerError {
    /// Build an error whose message is truncated to
    /// [`MAX_BROKER_ERROR_LEN`] characters. Messages already under the bound
    /// are kept unchanged.
    pub fn bounded(message: impl Into<String>) -> Self {
        let message: String = message.into();
        let message = if message.chars().count() > MAX_BROKER_ERROR_LEN {
            message.chars().take(MAX_BROKER_ERROR_LEN).collect()
        } else {
            message
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Future returned by a registered message handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), ConsumerError>> + Send>>;

/// Callback invoked by the broker layer for each delivery.
pub type MessageHandler = Arc<dyn Fn(Delivery) -> HandlerFuture + Send + Sync>;

/// Consumer registration options handed to the broker layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Queue to subscribe to.
    pub channel: String,
    /// Logger identity for observability wiring.
    pub logger: String,
    /// Maximum in-flight deliveries per consumer.
    pub prefetch_count: u16,
    /// Redelivery delay applied when the handler fails.
    pub retry_time: Duration,
}

/// Queue error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consumer registration failed: {0}")]
    Consume(String),
}

/// Broker client abstraction.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Put a payload on the named queue.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), QueueError>;

    /// Register `on_message` and start consuming.
    ///
    /// The consumer must be pulling messages by the time this returns. There
    /// is no clean-stop handle: consumers run until the process exits, and
    /// an in-flight delivery is not guaranteed to finish on shutdown.
    async fn consume(
        &self,
        options: ConsumerOptions,
        on_message: MessageHandler,
    ) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    async fn publish(&self, channel: &str, payload: String) -> Result<(), QueueError> {
        (**self).publish(channel, payload).await
    }

    async fn consume(
        &self,
        options: ConsumerOptions,
        on_message: MessageHandler,
    ) -> Result<(), QueueError> {
        (**self).consume(options, on_message).await
    }
}

/// Thin publish abstraction bound to one queue.
///
/// Turns "publish this job" into an outbound [`JobMessage`] on the
/// configured queue.
#[derive(Debug, Clone)]
pub struct QueueManager<Q> {
    queue: Q,
    queue_name: String,
}

impl<Q: MessageQueue> QueueManager<Q> {
    pub fn new(queue: Q, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Logger identity derived from the queue name.
    pub fn consumer_logger(&self) -> String {
        format!("{}-consumer", self.queue_name)
    }

    /// Publish the trigger for a job on the configured queue.
    pub async fn publish_trigger(&self, message: &JobMessage) -> Result<(), QueueError> {
        let payload = message
            .encode()
            .map_err(|e| QueueError::Publish(format!("encode failed: {e}")))?;
        self.queue.publish(&self.queue_name, payload).await
    }
}

/// In-memory queue for tests/dev.
///
/// Publishes are recorded rather than looped back; tests drive consumption
/// explicitly through [`InMemoryQueue::deliver`]. Deliveries are serialized
/// so at most one message is in flight, matching a prefetch of one.
#[derive(Default)]
pub struct InMemoryQueue {
    published: Mutex<Vec<(String, String)>>,
    consumer: Mutex<Option<(ConsumerOptions, MessageHandler)>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Messages published so far, as `(channel, payload)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Options the consumer registered with, if any.
    pub fn consumer_options(&self) -> Option<ConsumerOptions> {
        self.consumer.lock().unwrap().as_ref().map(|(o, _)| o.clone())
    }

    /// Hand one payload to the registered consumer and await its outcome.
    ///
    /// Holds the in-flight slot for the duration of the handler, so
    /// concurrent callers line up the way a prefetch-one consumer would.
    ///
    /// Panics if no consumer has been registered.
    pub async fn deliver(&self, payload: impl Into<String>) -> Result<(), ConsumerError> {
        let handler = {
            let consumer = self.consumer.lock().unwrap();
            let (_, handler) = consumer.as_ref().expect("no consumer registered");
            Arc::clone(handler)
        };

        let _slot = self.in_flight.lock().await;
        handler(Delivery::new(payload)).await
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), QueueError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
        Ok(())
    }

    async fn consume(
        &self,
        options: ConsumerOptions,
        on_message: MessageHandler,
    ) -> Result<(), QueueError> {
        *self.consumer.lock().unwrap() = Some((options, on_message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conveyor_core::ProgramId;

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            channel: "programs".to_string(),
            logger: "programs-consumer".to_string(),
            prefetch_count: 1,
            retry_time: Duration::from_secs(60),
        }
    }

    #[test]
    fn bounded_truncates_to_exactly_the_limit() {
        let long = "x".repeat(MAX_BROKER_ERROR_LEN * 3);
        let err = ConsumerError::bounded(long);

        assert_eq!(err.message().chars().count(), MAX_BROKER_ERROR_LEN);
    }

    #[test]
    fn bounded_keeps_short_messages_unchanged() {
        let err = ConsumerError::bounded("connection refused");
        assert_eq!(err.message(), "connection refused");
    }

    #[test]
    fn bounded_counts_characters_not_bytes() {
        // Multi-byte characters must not be split mid-codepoint.
        let long = "é".repeat(MAX_BROKER_ERROR_LEN + 10);
        let err = ConsumerError::bounded(long);

        assert_eq!(err.message().chars().count(), MAX_BROKER_ERROR_LEN);
    }

    proptest::proptest! {
        #[test]
        fn bounded_never_exceeds_the_limit(s in ".*") {
            let err = ConsumerError::bounded(s);
            proptest::prop_assert!(err.message().chars().count() <= MAX_BROKER_ERROR_LEN);
        }
    }

    #[tokio::test]
    async fn manager_publishes_on_its_queue() {
        let queue = InMemoryQueue::arc();
        let manager = QueueManager::new(Arc::clone(&queue), "programs");
        let message = JobMessage::new(ProgramId::new(), "extract");

        manager.publish_trigger(&message).await.unwrap();

        let published = queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "programs");
        assert_eq!(JobMessage::decode(&published[0].1).unwrap(), message);
    }

    #[test]
    fn manager_derives_consumer_logger_from_queue_name() {
        let manager = QueueManager::new(InMemoryQueue::new(), "programs");
        assert_eq!(manager.consumer_logger(), "programs-consumer");
    }

    #[tokio::test]
    async fn deliver_invokes_the_registered_handler() {
        let queue = InMemoryQueue::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = Arc::clone(&seen);

        let handler: MessageHandler = Arc::new(move |delivery| {
            let seen = Arc::clone(&seen_by_handler);
            Box::pin(async move {
                seen.lock().unwrap().push(delivery.payload().to_string());
                Ok(())
            })
        });
        queue.consume(options(), handler).await.unwrap();

        queue.deliver("hello").await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), ["hello".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_deliveries_do_not_interleave() {
        let queue = InMemoryQueue::arc();
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let trace_by_handler = Arc::clone(&trace);

        let handler: MessageHandler = Arc::new(move |_delivery| {
            let trace = Arc::clone(&trace_by_handler);
            Box::pin(async move {
                trace.lock().unwrap().push("start");
                tokio::time::sleep(Duration::from_millis(20)).await;
                trace.lock().unwrap().push("end");
                Ok(())
            })
        });
        queue.consume(options(), handler).await.unwrap();

        let (a, b) = tokio::join!(queue.deliver("one"), queue.deliver("two"));
        a.unwrap();
        b.unwrap();

        assert_eq!(
            trace.lock().unwrap().as_slice(),
            ["start", "end", "start", "end"]
        );
    }
}
