use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use conveyor_helpers::{
    backoff::{BackoffStore, DelayUnit, RetryStrategy},
    consumers::{
        DeliveryInfo, Message, MessageConsumer, MessageHandler, MessageHandlerError,
        MessageOutcome, MessageProcessingError,
    },
    idempotency::IdempotencyStore,
    time::Clock,
};
use futures::future::join_all;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info_span, instrument, warn, Instrument};

use crate::{
    errors::{ConfigError, ConsumerError},
    queue_client::{QueueClient, MAX_VISIBILITY_TIMEOUT_SECONDS},
    types::{delivery_info, SQSMessageMetadata, ToMessageHandle},
};

/// The pause before polling again after a transport error on receive
/// that is not an authentication or endpoint connection problem.
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(5);

// Lifecycle states for the consumer.
const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// Configuration for an SQS message consumer.
#[derive(Debug, Clone, Default)]
pub struct SQSConsumerConfig {
    /// The URL of the SQS queue to consume messages from.
    pub queue_url: String,
    /// The maximum number of messages to receive in a single call to SQS.
    /// SQS only allows a maximum of 10 messages per call.
    ///
    /// Defaults to 10 messages.
    pub max_number_of_messages: Option<i32>,
    /// The time to wait for messages to become available in each receive
    /// call (long polling). SQS only allows up to 20 seconds.
    ///
    /// Defaults to 20 seconds.
    pub wait_time_seconds: Option<i32>,
    /// The visibility timeout to set for received messages.
    ///
    /// Defaults to 30 seconds.
    pub visibility_timeout: Option<i32>,
    /// The queue's redrive threshold. This is only used to derive the
    /// last-attempt flag passed to handlers, the queue itself enforces
    /// the redrive policy.
    pub max_receive_count: Option<u32>,
    /// The time to sleep when a poll returns no messages, in milliseconds.
    ///
    /// Defaults to 1000 milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Whether to process the messages of a received batch concurrently.
    /// Sequential processing preserves arrival order within a batch and
    /// is the safe choice for handlers that are not reentrant.
    ///
    /// Defaults to false.
    pub process_in_parallel: bool,
    /// The maximum time to wait for a message handler to complete,
    /// in seconds. A handler that exceeds this is treated as a
    /// transient failure. No timeout is applied when not set.
    pub message_handler_timeout: Option<u64>,
    /// The pause before polling again after an authentication or
    /// endpoint connection error, in milliseconds.
    ///
    /// Defaults to 10000 milliseconds.
    pub auth_error_timeout_ms: Option<u64>,
    /// How long idempotency entries live after a message is marked
    /// processed, in seconds.
    ///
    /// Defaults to 86400 seconds (24 hours).
    pub idempotency_ttl_seconds: Option<u64>,
    /// Whether to mark a message as processed in the idempotency store
    /// before dispatching the handler, so that concurrent deliveries of
    /// the same message across replicas are deduplicated. The mark is
    /// removed again whenever the message is classified for retry.
    ///
    /// Defaults to false, marking only after the handler completes.
    pub pre_mark_idempotent: bool,
    /// The base delay recorded with each failure in the backoff store.
    ///
    /// Defaults to 5.
    pub backoff_base_delay: Option<u64>,
    /// The unit of the base delay.
    ///
    /// Defaults to seconds.
    pub backoff_base_delay_unit: Option<DelayUnit>,
    /// The strategy used to compute per-message cool-down intervals.
    ///
    /// Defaults to exponential.
    pub retry_strategy: Option<RetryStrategy>,
}

#[derive(Debug)]
struct SQSConsumerFinalisedConfig {
    queue_url: String,
    max_number_of_messages: i32,
    wait_time_seconds: i32,
    visibility_timeout: i32,
    max_receive_count: Option<u32>,
    poll_interval_ms: u64,
    process_in_parallel: bool,
    message_handler_timeout: Option<u64>,
    auth_error_timeout_ms: u64,
    idempotency_ttl_seconds: u64,
    pre_mark_idempotent: bool,
    backoff_base_delay: u64,
    backoff_base_delay_unit: DelayUnit,
    retry_strategy: RetryStrategy,
}

impl SQSConsumerFinalisedConfig {
    fn from_config(config: SQSConsumerConfig) -> Result<Self, ConfigError> {
        if config.queue_url.trim().is_empty() {
            return Err(ConfigError::MissingQueueUrl);
        }

        let max_number_of_messages = config.max_number_of_messages.unwrap_or(10);
        if !(1..=10).contains(&max_number_of_messages) {
            return Err(ConfigError::InvalidMaxNumberOfMessages(
                max_number_of_messages,
            ));
        }

        let wait_time_seconds = config.wait_time_seconds.unwrap_or(20);
        if !(0..=20).contains(&wait_time_seconds) {
            return Err(ConfigError::InvalidWaitTimeSeconds(wait_time_seconds));
        }

        let visibility_timeout = config.visibility_timeout.unwrap_or(30);
        if visibility_timeout < 0 {
            return Err(ConfigError::InvalidVisibilityTimeout(visibility_timeout));
        }

        if let Some(max_receive_count) = config.max_receive_count {
            if max_receive_count == 0 {
                return Err(ConfigError::InvalidMaxReceiveCount(max_receive_count));
            }
        }

        let poll_interval_ms = config.poll_interval_ms.unwrap_or(1000);
        if poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval(poll_interval_ms));
        }

        if let Some(message_handler_timeout) = config.message_handler_timeout {
            if message_handler_timeout == 0 {
                return Err(ConfigError::InvalidMessageHandlerTimeout(
                    message_handler_timeout,
                ));
            }
        }

        let idempotency_ttl_seconds = config.idempotency_ttl_seconds.unwrap_or(86_400);
        if idempotency_ttl_seconds == 0 {
            return Err(ConfigError::InvalidIdempotencyTtl(idempotency_ttl_seconds));
        }

        let backoff_base_delay = config.backoff_base_delay.unwrap_or(5);
        if backoff_base_delay == 0 {
            return Err(ConfigError::InvalidBackoffBaseDelay(backoff_base_delay));
        }

        Ok(SQSConsumerFinalisedConfig {
            queue_url: config.queue_url,
            max_number_of_messages,
            wait_time_seconds,
            visibility_timeout,
            max_receive_count: config.max_receive_count,
            poll_interval_ms,
            process_in_parallel: config.process_in_parallel,
            message_handler_timeout: config.message_handler_timeout,
            auth_error_timeout_ms: config.auth_error_timeout_ms.unwrap_or(10_000),
            idempotency_ttl_seconds,
            pre_mark_idempotent: config.pre_mark_idempotent,
            backoff_base_delay,
            backoff_base_delay_unit: config
                .backoff_base_delay_unit
                .unwrap_or(DelayUnit::Seconds),
            retry_strategy: config.retry_strategy.unwrap_or(RetryStrategy::Exponential),
        })
    }
}

// How a single received message left the batch pipeline.
#[derive(Debug, PartialEq, Eq)]
enum MessageDisposition {
    // Delete from the queue: processed, suppressed as a duplicate,
    // or permanently failed.
    Success,
    PermanentFailure,
    // Leave on the queue so it redelivers. When a backoff delay is
    // known, the visibility timeout is re-set so the redelivery does
    // not arrive before the cool-down has elapsed.
    Retry { delay_ms: Option<u64> },
    // Still cooling down; leave untouched without dispatching.
    Skip,
}

/// An SQS message consumer that polls a queue and pipes every received
/// message through backoff and idempotency gates before dispatching the
/// registered handler, then settles the whole batch with a single
/// batched delete call.
///
/// Messages classified for retry are never deleted; they are redelivered
/// by SQS once their visibility timeout lapses and the backoff gate
/// holds them until their cool-down has elapsed.
pub struct SQSMessageConsumer {
    handler: Option<Arc<dyn MessageHandler<SQSMessageMetadata> + Send + Sync>>,
    queue_client: Arc<dyn QueueClient>,
    idempotency_store: Option<Arc<dyn IdempotencyStore>>,
    backoff_store: Option<Arc<dyn BackoffStore>>,
    clock: Arc<dyn Clock + Send + Sync>,
    state: Arc<AtomicU8>,
    shutdown_tx: broadcast::Sender<()>,
    poll_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    config: Arc<SQSConsumerFinalisedConfig>,
}

impl Debug for SQSMessageConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SQSMessageConsumer")
    }
}

impl Clone for SQSMessageConsumer {
    fn clone(&self) -> Self {
        SQSMessageConsumer {
            handler: self.handler.clone(),
            queue_client: self.queue_client.clone(),
            idempotency_store: self.idempotency_store.clone(),
            backoff_store: self.backoff_store.clone(),
            clock: self.clock.clone(),
            state: self.state.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            poll_task: self.poll_task.clone(),
            config: self.config.clone(),
        }
    }
}

#[async_trait]
impl MessageConsumer<SQSMessageMetadata> for SQSMessageConsumer {
    type Error = ConsumerError;

    fn register_handler(
        &mut self,
        handler: Arc<dyn MessageHandler<SQSMessageMetadata> + Send + Sync>,
    ) {
        self.handler = Some(handler);
    }

    #[instrument(name = "sqs_message_consumer", skip(self))]
    async fn start(&self) -> Result<(), ConsumerError> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("consumer is not idle, ignoring start request");
            return Ok(());
        }

        let consumer = Arc::new(self.clone());
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { consumer.run_polling_loop(shutdown_rx).await });
        *self.poll_task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!("consumer is not running, ignoring stop request");
            return Ok(());
        }

        // The polling task observes this and exits once any in-flight
        // batch has been settled.
        let _ = self.shutdown_tx.send(());

        let poll_task = self.poll_task.lock().await.take();
        if let Some(poll_task) = poll_task {
            if let Err(err) = poll_task.await {
                self.state.store(STATE_IDLE, Ordering::SeqCst);
                return Err(ConsumerError::new(format!(
                    "polling task did not shut down cleanly: {err}"
                )));
            }
        }
        self.state.store(STATE_IDLE, Ordering::SeqCst);
        Ok(())
    }
}

impl SQSMessageConsumer {
    /// Creates a new consumer over the given queue client.
    /// Configuration is validated here; a consumer is never constructed
    /// from out-of-range configuration.
    pub fn new(
        queue_client: Arc<dyn QueueClient>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: SQSConsumerConfig,
    ) -> Result<SQSMessageConsumer, ConfigError> {
        let final_config = SQSConsumerFinalisedConfig::from_config(config)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(SQSMessageConsumer {
            handler: None,
            queue_client,
            idempotency_store: None,
            backoff_store: None,
            clock,
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            shutdown_tx,
            poll_task: Arc::new(Mutex::new(None)),
            config: Arc::new(final_config),
        })
    }

    /// Attaches an idempotency store used to suppress redeliveries of
    /// messages that were already processed. Without one, no
    /// deduplication is performed.
    pub fn set_idempotency_store(&mut self, store: Arc<dyn IdempotencyStore>) {
        self.idempotency_store = Some(store);
    }

    /// Attaches a backoff store used to hold messages that recently
    /// failed until their cool-down has elapsed. Without one, the
    /// visibility timeout alone governs redelivery pacing.
    pub fn set_backoff_store(&mut self, store: Arc<dyn BackoffStore>) {
        self.backoff_store = Some(store);
    }

    async fn run_polling_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let worker_span = info_span!(
            "sqs_message_consumer_worker",
            queue_url = %self.config.queue_url
        );
        async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = self.queue_client.receive(
                        self.config.max_number_of_messages,
                        self.config.wait_time_seconds,
                        self.config.visibility_timeout,
                    ) => result,
                };

                match received {
                    Err(err) => {
                        let pause = if err.is_connection_error() {
                            debug!("there was an authentication error. pausing before retrying.");
                            Duration::from_millis(self.config.auth_error_timeout_ms)
                        } else {
                            error!("failed to receive messages from queue: {err}");
                            RECEIVE_ERROR_PAUSE
                        };
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = sleep(pause) => {}
                        }
                    }
                    Ok(messages) if messages.is_empty() => {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                        }
                    }
                    // An in-flight batch always runs to completion; a stop
                    // request is observed on the next iteration.
                    Ok(messages) => self.process_batch(messages).await,
                }
            }
            debug!("polling loop exited");
        }
        .instrument(worker_span)
        .await
    }

    #[instrument(skip(self, messages), fields(batch_size = messages.len()))]
    async fn process_batch(&self, messages: Vec<Message<SQSMessageMetadata>>) {
        let dispositions = if self.config.process_in_parallel {
            join_all(
                messages
                    .iter()
                    .map(|message| self.process_message(message)),
            )
            .await
        } else {
            let mut dispositions = Vec::with_capacity(messages.len());
            for message in &messages {
                dispositions.push(self.process_message(message).await);
            }
            dispositions
        };

        let mut to_delete = Vec::new();
        let mut retries = Vec::new();
        for (message, disposition) in messages.iter().zip(dispositions) {
            match disposition {
                MessageDisposition::Success | MessageDisposition::PermanentFailure => {
                    to_delete.push(message.to_message_handle())
                }
                MessageDisposition::Retry { delay_ms } => {
                    retries.push((message.to_message_handle(), delay_ms))
                }
                MessageDisposition::Skip => {}
            }
        }

        if !to_delete.is_empty() {
            debug!("deleting settled message batch");
            if let Err(err) = self.queue_client.delete_batch(&to_delete).await {
                error!(
                    "failed to delete messages from queue, they will be redelivered: {err}"
                );
            }
        }

        for (handle, delay_ms) in retries {
            let Some(delay_ms) = delay_ms else {
                continue;
            };
            let new_visibility =
                (delay_ms / 1000).min(MAX_VISIBILITY_TIMEOUT_SECONDS as u64) as i32;
            if let Err(err) = self
                .queue_client
                .change_visibility(&handle, new_visibility)
                .await
            {
                warn!(
                    "failed to change message visibility, \
                    the default visibility timeout will govern redelivery: {err}"
                );
            }
        }
    }

    async fn process_message(
        &self,
        message: &Message<SQSMessageMetadata>,
    ) -> MessageDisposition {
        let message_id = message.message_id.as_str();

        if let Some(backoff_store) = &self.backoff_store {
            match backoff_store.can_process(message_id).await {
                Ok(false) => {
                    debug!(
                        message_id,
                        "message is cooling down, leaving it for a later delivery"
                    );
                    return MessageDisposition::Skip;
                }
                Ok(true) => {}
                Err(err) => {
                    warn!(
                        message_id,
                        "backoff store unavailable, processing message anyway: {err}"
                    );
                }
            }
        }

        if let Some(idempotency_store) = &self.idempotency_store {
            match idempotency_store.has_processed(message_id).await {
                Ok(true) => {
                    debug!(
                        message_id,
                        "message was already processed, deleting the redelivery"
                    );
                    return MessageDisposition::Success;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        message_id,
                        "idempotency store unavailable, processing message anyway: {err}"
                    );
                }
            }

            if self.config.pre_mark_idempotent {
                if let Err(err) = idempotency_store
                    .mark_processed(message_id, self.config.idempotency_ttl_seconds)
                    .await
                {
                    warn!(message_id, "failed to pre-mark message as processed: {err}");
                }
            }
        }

        let delivery = delivery_info(&message.metadata, self.config.max_receive_count);
        let outcome = classify_handler_result(self.dispatch_handler(message, &delivery).await);
        self.settle_outcome(message_id, outcome).await
    }

    async fn dispatch_handler(
        &self,
        message: &Message<SQSMessageMetadata>,
        delivery: &DeliveryInfo,
    ) -> Result<MessageOutcome, MessageHandlerError> {
        let handler = match &self.handler {
            Some(handler) => handler,
            None => {
                error!("message handler was not registered");
                return Err(MessageHandlerError::MissingHandler);
            }
        };

        let handler_future = handler.handle(message, delivery);
        match self.config.message_handler_timeout {
            Some(handler_timeout) => {
                debug!(
                    timeout = handler_timeout,
                    "running message handler with timeout",
                );
                match timeout(Duration::from_secs(handler_timeout), handler_future).await {
                    Err(timeout_err) => Err(MessageHandlerError::Timeout(timeout_err)),
                    Ok(result) => result,
                }
            }
            None => handler_future.await,
        }
    }

    async fn settle_outcome(
        &self,
        message_id: &str,
        outcome: MessageOutcome,
    ) -> MessageDisposition {
        match outcome {
            MessageOutcome::Success => {
                if let Some(idempotency_store) = &self.idempotency_store {
                    if !self.config.pre_mark_idempotent {
                        if let Err(err) = idempotency_store
                            .mark_processed(message_id, self.config.idempotency_ttl_seconds)
                            .await
                        {
                            warn!(message_id, "failed to mark message as processed: {err}");
                        }
                    }
                }
                if let Some(backoff_store) = &self.backoff_store {
                    if let Err(err) = backoff_store.clear(message_id).await {
                        warn!(message_id, "failed to clear backoff entry: {err}");
                    }
                }
                MessageDisposition::Success
            }
            MessageOutcome::Retry { reason } => {
                warn!(
                    message_id,
                    "message handler requested a retry: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                if self.config.pre_mark_idempotent {
                    if let Some(idempotency_store) = &self.idempotency_store {
                        if let Err(err) = idempotency_store.remove(message_id).await {
                            warn!(
                                message_id,
                                "failed to remove idempotency pre-mark, redeliveries \
                                of this message may be suppressed: {err}"
                            );
                        }
                    }
                }
                let delay_ms = self.record_backoff_failure(message_id).await;
                MessageDisposition::Retry { delay_ms }
            }
            MessageOutcome::Failure { reason } => {
                error!(
                    message_id,
                    "message handler reported a permanent failure, deleting message: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                // The idempotency mark is kept (or set) so any redelivery
                // that slips in before the delete is suppressed.
                if let Some(idempotency_store) = &self.idempotency_store {
                    if !self.config.pre_mark_idempotent {
                        if let Err(err) = idempotency_store
                            .mark_processed(message_id, self.config.idempotency_ttl_seconds)
                            .await
                        {
                            warn!(
                                message_id,
                                "failed to mark permanently failed message: {err}"
                            );
                        }
                    }
                }
                MessageDisposition::PermanentFailure
            }
        }
    }

    async fn record_backoff_failure(&self, message_id: &str) -> Option<u64> {
        let backoff_store = self.backoff_store.as_ref()?;
        match backoff_store
            .record_failure(
                message_id,
                self.config.backoff_base_delay,
                self.config.backoff_base_delay_unit,
                self.config.retry_strategy,
            )
            .await
        {
            Ok(next_retry_instant) => {
                Some(next_retry_instant.saturating_sub(self.clock.now_ms()))
            }
            Err(err) => {
                warn!(
                    message_id,
                    "failed to record failure in backoff store: {err}"
                );
                None
            }
        }
    }
}

/// Collapses the two handler surfaces into a single terminal outcome.
/// Errors that do not carry an explicit classification are treated as
/// transient so the message is redelivered rather than lost.
fn classify_handler_result(
    result: Result<MessageOutcome, MessageHandlerError>,
) -> MessageOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(MessageHandlerError::HandlerFailure(err)) => {
            match err.downcast_ref::<MessageProcessingError>() {
                Some(MessageProcessingError::Fatal(reason)) => MessageOutcome::Failure {
                    reason: Some(reason.clone()),
                },
                Some(MessageProcessingError::Transient(reason)) => MessageOutcome::Retry {
                    reason: Some(reason.clone()),
                },
                None => MessageOutcome::Retry {
                    reason: Some(err.to_string()),
                },
            }
        }
        Err(err) => MessageOutcome::Retry {
            reason: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, fmt::Display, future::pending};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug)]
    struct TestHandlerError {
        message: String,
    }

    impl Display for TestHandlerError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Test handler error: {}", self.message)
        }
    }

    impl Error for TestHandlerError {}

    fn config_with_queue_url() -> SQSConsumerConfig {
        SQSConsumerConfig {
            queue_url: "http://sqs.eu-west-2.localhost:4566/000000000000/orders".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_returned_outcomes_pass_through_classification() {
        assert_eq!(
            classify_handler_result(Ok(MessageOutcome::Success)),
            MessageOutcome::Success
        );
        assert_eq!(
            classify_handler_result(Ok(MessageOutcome::Retry { reason: None })),
            MessageOutcome::Retry { reason: None }
        );
        assert_eq!(
            classify_handler_result(Ok(MessageOutcome::Failure {
                reason: Some("bad payload".to_string())
            })),
            MessageOutcome::Failure {
                reason: Some("bad payload".to_string())
            }
        );
    }

    #[test]
    fn test_typed_processing_errors_are_recovered_by_downcast() {
        let fatal = classify_handler_result(Err(MessageHandlerError::HandlerFailure(Box::new(
            MessageProcessingError::Fatal("schema mismatch".to_string()),
        ))));
        assert_eq!(
            fatal,
            MessageOutcome::Failure {
                reason: Some("schema mismatch".to_string())
            }
        );

        let transient = classify_handler_result(Err(MessageHandlerError::HandlerFailure(
            Box::new(MessageProcessingError::Transient(
                "downstream unavailable".to_string(),
            )),
        )));
        assert_eq!(
            transient,
            MessageOutcome::Retry {
                reason: Some("downstream unavailable".to_string())
            }
        );
    }

    #[test]
    fn test_unrecognised_errors_are_classified_for_retry() {
        let outcome = classify_handler_result(Err(MessageHandlerError::HandlerFailure(
            Box::new(TestHandlerError {
                message: "an unexpected error occurred".to_string(),
            }),
        )));
        assert_eq!(
            outcome,
            MessageOutcome::Retry {
                reason: Some(
                    "message handler failed: Test handler error: \
                    an unexpected error occurred"
                        .to_string()
                )
            }
        );

        assert!(matches!(
            classify_handler_result(Err(MessageHandlerError::MissingHandler)),
            MessageOutcome::Retry { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_handler_timeouts_are_classified_for_retry() {
        let timeout_err = timeout(Duration::from_millis(1), pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(
            classify_handler_result(Err(MessageHandlerError::Timeout(timeout_err))),
            MessageOutcome::Retry { .. }
        ));
    }

    #[test]
    fn test_configuration_defaults_are_applied() {
        let final_config =
            SQSConsumerFinalisedConfig::from_config(config_with_queue_url()).unwrap();
        assert_eq!(final_config.max_number_of_messages, 10);
        assert_eq!(final_config.wait_time_seconds, 20);
        assert_eq!(final_config.visibility_timeout, 30);
        assert_eq!(final_config.poll_interval_ms, 1000);
        assert_eq!(final_config.auth_error_timeout_ms, 10_000);
        assert_eq!(final_config.idempotency_ttl_seconds, 86_400);
        assert_eq!(final_config.backoff_base_delay, 5);
        assert_eq!(final_config.backoff_base_delay_unit, DelayUnit::Seconds);
        assert_eq!(final_config.retry_strategy, RetryStrategy::Exponential);
        assert!(!final_config.process_in_parallel);
        assert!(!final_config.pre_mark_idempotent);
    }

    #[test]
    fn test_configuration_rejects_out_of_range_values() {
        let missing_url = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig::default());
        assert_eq!(missing_url.unwrap_err(), ConfigError::MissingQueueUrl);

        let too_many_messages = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            max_number_of_messages: Some(11),
            ..config_with_queue_url()
        });
        assert_eq!(
            too_many_messages.unwrap_err(),
            ConfigError::InvalidMaxNumberOfMessages(11)
        );

        let zero_messages = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            max_number_of_messages: Some(0),
            ..config_with_queue_url()
        });
        assert_eq!(
            zero_messages.unwrap_err(),
            ConfigError::InvalidMaxNumberOfMessages(0)
        );

        let long_wait = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            wait_time_seconds: Some(21),
            ..config_with_queue_url()
        });
        assert_eq!(
            long_wait.unwrap_err(),
            ConfigError::InvalidWaitTimeSeconds(21)
        );

        let negative_visibility = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            visibility_timeout: Some(-1),
            ..config_with_queue_url()
        });
        assert_eq!(
            negative_visibility.unwrap_err(),
            ConfigError::InvalidVisibilityTimeout(-1)
        );

        let zero_poll_interval = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            poll_interval_ms: Some(0),
            ..config_with_queue_url()
        });
        assert_eq!(
            zero_poll_interval.unwrap_err(),
            ConfigError::InvalidPollInterval(0)
        );

        let zero_max_receive_count = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            max_receive_count: Some(0),
            ..config_with_queue_url()
        });
        assert_eq!(
            zero_max_receive_count.unwrap_err(),
            ConfigError::InvalidMaxReceiveCount(0)
        );

        let zero_backoff_delay = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            backoff_base_delay: Some(0),
            ..config_with_queue_url()
        });
        assert_eq!(
            zero_backoff_delay.unwrap_err(),
            ConfigError::InvalidBackoffBaseDelay(0)
        );

        let zero_ttl = SQSConsumerFinalisedConfig::from_config(SQSConsumerConfig {
            idempotency_ttl_seconds: Some(0),
            ..config_with_queue_url()
        });
        assert_eq!(zero_ttl.unwrap_err(), ConfigError::InvalidIdempotencyTtl(0));
    }
}
