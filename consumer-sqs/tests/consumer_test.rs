use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use pretty_assertions::assert_eq;
use tokio::time::sleep;

use conveyor_consumer_sqs::{
    errors::QueueClientError,
    message_consumer::{SQSConsumerConfig, SQSMessageConsumer},
    queue_client::QueueClient,
    types::{MessageHandle, SQSMessageMetadata},
};
use conveyor_helpers::{
    backoff::{BackoffStore, DelayUnit, InMemoryBackoffStore, RetryStrategy},
    consumers::{
        DeliveryInfo, Message, MessageConsumer, MessageHandler, MessageHandlerError,
        MessageOutcome,
    },
    idempotency::{IdempotencyStore, InMemoryIdempotencyStore},
    time::Clock,
};

struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// A queue client over scripted in-memory batches that records every
// delete and change-visibility call the consumer issues.
struct MockQueueClient {
    batches: Mutex<VecDeque<Vec<Message<SQSMessageMetadata>>>>,
    deletes: Mutex<Vec<Vec<MessageHandle>>>,
    visibility_changes: Mutex<Vec<(MessageHandle, i32)>>,
}

impl MockQueueClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(VecDeque::new()),
            deletes: Mutex::new(Vec::new()),
            visibility_changes: Mutex::new(Vec::new()),
        })
    }

    fn push_batch(&self, batch: Vec<Message<SQSMessageMetadata>>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    fn batches_remaining(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    fn deletes(&self) -> Vec<Vec<MessageHandle>> {
        self.deletes.lock().unwrap().clone()
    }

    fn visibility_changes(&self) -> Vec<(MessageHandle, i32)> {
        self.visibility_changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn receive(
        &self,
        _max_messages: i32,
        _wait_time_seconds: i32,
        _visibility_timeout: i32,
    ) -> Result<Vec<Message<SQSMessageMetadata>>, QueueClientError> {
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn delete_batch(&self, handles: &[MessageHandle]) -> Result<(), QueueClientError> {
        self.deletes.lock().unwrap().push(handles.to_vec());
        Ok(())
    }

    async fn change_visibility(
        &self,
        handle: &MessageHandle,
        visibility_timeout_seconds: i32,
    ) -> Result<(), QueueClientError> {
        self.visibility_changes
            .lock()
            .unwrap()
            .push((handle.clone(), visibility_timeout_seconds));
        Ok(())
    }
}

type HandlerResult = Result<MessageOutcome, MessageHandlerError>;

// A handler that replays scripted results and records every invocation,
// returning success once the script runs out.
struct ScriptedHandler {
    results: Mutex<VecDeque<HandlerResult>>,
    invocations: Mutex<Vec<(String, DeliveryInfo)>>,
}

impl ScriptedHandler {
    fn new(results: Vec<HandlerResult>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into_iter().collect()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    fn always_successful() -> Arc<Self> {
        Self::new(Vec::new())
    }

    fn invocations(&self) -> Vec<(String, DeliveryInfo)> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler<SQSMessageMetadata> for ScriptedHandler {
    async fn handle(
        &self,
        message: &Message<SQSMessageMetadata>,
        delivery: &DeliveryInfo,
    ) -> Result<MessageOutcome, MessageHandlerError> {
        self.invocations
            .lock()
            .unwrap()
            .push((message.message_id.clone(), delivery.clone()));
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(MessageOutcome::Success))
    }
}

fn test_message(
    message_id: &str,
    body: &str,
    receive_count: Option<u32>,
) -> Message<SQSMessageMetadata> {
    let attributes = receive_count.map(|count| {
        HashMap::from([(
            MessageSystemAttributeName::ApproximateReceiveCount,
            count.to_string(),
        )])
    });
    Message {
        message_id: message_id.to_string(),
        body: Some(body.to_string()),
        md5_of_body: None,
        metadata: SQSMessageMetadata {
            receipt_handle: Some(format!("receipt-{message_id}")),
            attributes,
            ..Default::default()
        },
    }
}

fn test_config() -> SQSConsumerConfig {
    SQSConsumerConfig {
        queue_url: "http://sqs.eu-west-2.localhost:4566/000000000000/orders".to_string(),
        // Keep idle sleeps short so the scenarios settle quickly.
        poll_interval_ms: Some(20),
        ..Default::default()
    }
}

fn build_consumer(
    queue: Arc<MockQueueClient>,
    clock: Arc<TestClock>,
    handler: Arc<ScriptedHandler>,
    config: SQSConsumerConfig,
) -> SQSMessageConsumer {
    let mut consumer = SQSMessageConsumer::new(queue, clock, config)
        .expect("consumer configuration must be valid");
    consumer.register_handler(handler);
    consumer
}

async fn wait_for(description: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {description}");
}

// Lets in-flight polling settle before asserting that something
// did NOT happen.
async fn settle(queue: &MockQueueClient) {
    wait_for("scripted batches to be consumed", || {
        queue.batches_remaining() == 0
    })
    .await;
    sleep(Duration::from_millis(150)).await;
}

#[test_log::test(tokio::test)]
async fn test_successful_message_is_deleted_with_its_receipt_handle() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::always_successful();
    queue.push_batch(vec![test_message(
        "message-1",
        "{\"postId\":\"1\",\"content\":\"Hello\"}",
        None,
    )]);

    let consumer = build_consumer(queue.clone(), clock, handler.clone(), test_config());
    consumer.start().await.unwrap();
    wait_for("the message to be deleted", || !queue.deletes().is_empty()).await;
    consumer.stop().await.unwrap();

    assert_eq!(
        handler.invocations(),
        vec![(
            "message-1".to_string(),
            DeliveryInfo {
                retry_count: 0,
                is_last_attempt: false,
            }
        )]
    );
    assert_eq!(
        queue.deletes(),
        vec![vec![MessageHandle {
            message_id: Some("message-1".to_string()),
            receipt_handle: Some("receipt-message-1".to_string()),
        }]]
    );
    assert_eq!(queue.visibility_changes(), vec![]);
}

#[test_log::test(tokio::test)]
async fn test_retried_message_is_left_on_the_queue() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::new(vec![Ok(MessageOutcome::Retry {
        reason: Some("downstream unavailable".to_string()),
    })]);
    queue.push_batch(vec![test_message("message-1", "retry me", Some(2))]);

    let consumer = build_consumer(queue.clone(), clock, handler.clone(), test_config());
    consumer.start().await.unwrap();
    settle(&queue).await;
    consumer.stop().await.unwrap();

    assert_eq!(
        handler.invocations(),
        vec![(
            "message-1".to_string(),
            DeliveryInfo {
                retry_count: 2,
                is_last_attempt: false,
            }
        )]
    );
    // No backoff store is configured, so the message is neither deleted
    // nor re-visibility-set; SQS's own timeout governs redelivery.
    assert_eq!(queue.deletes(), Vec::<Vec<MessageHandle>>::new());
    assert_eq!(queue.visibility_changes(), vec![]);
}

#[test_log::test(tokio::test)]
async fn test_permanently_failed_message_is_deleted_and_stays_marked() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::new(vec![Ok(MessageOutcome::Failure {
        reason: Some("malformed payload".to_string()),
    })]);
    let idempotency_store = Arc::new(InMemoryIdempotencyStore::new(clock.clone()));
    queue.push_batch(vec![test_message("message-1", "not json at all", None)]);

    let mut consumer = build_consumer(queue.clone(), clock, handler.clone(), test_config());
    consumer.set_idempotency_store(idempotency_store.clone());
    consumer.start().await.unwrap();
    wait_for("the message to be deleted", || !queue.deletes().is_empty()).await;
    consumer.stop().await.unwrap();

    assert_eq!(queue.deletes().len(), 1);
    assert!(idempotency_store.has_processed("message-1").await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_already_processed_message_is_deleted_without_dispatch() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::always_successful();
    let idempotency_store = Arc::new(InMemoryIdempotencyStore::new(clock.clone()));
    idempotency_store
        .mark_processed("msg-duplicate-1", 3600)
        .await
        .unwrap();
    queue.push_batch(vec![test_message("msg-duplicate-1", "duplicate", None)]);

    let mut consumer = build_consumer(queue.clone(), clock, handler.clone(), test_config());
    consumer.set_idempotency_store(idempotency_store);
    consumer.start().await.unwrap();
    wait_for("the duplicate to be deleted", || {
        !queue.deletes().is_empty()
    })
    .await;
    consumer.stop().await.unwrap();

    assert_eq!(handler.invocations(), vec![]);
    assert_eq!(
        queue.deletes(),
        vec![vec![MessageHandle {
            message_id: Some("msg-duplicate-1".to_string()),
            receipt_handle: Some("receipt-msg-duplicate-1".to_string()),
        }]]
    );
}

#[test_log::test(tokio::test)]
async fn test_backoff_gate_holds_messages_until_cool_down_elapses() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(100_000));
    let handler = ScriptedHandler::always_successful();
    let backoff_store = Arc::new(InMemoryBackoffStore::new(clock.clone()));
    backoff_store
        .record_failure(
            "msg-B",
            5000,
            DelayUnit::Milliseconds,
            RetryStrategy::Exponential,
        )
        .await
        .unwrap();
    queue.push_batch(vec![test_message("msg-B", "gated", Some(1))]);

    let mut consumer = build_consumer(queue.clone(), clock.clone(), handler.clone(), test_config());
    consumer.set_backoff_store(backoff_store);
    consumer.start().await.unwrap();

    // An immediate redelivery is skipped entirely.
    settle(&queue).await;
    assert_eq!(handler.invocations(), vec![]);
    assert_eq!(queue.deletes(), Vec::<Vec<MessageHandle>>::new());

    // Once the cool-down elapses a redelivery goes through to the handler.
    clock.advance(5_000);
    queue.push_batch(vec![test_message("msg-B", "gated", Some(2))]);
    wait_for("the gated message to be processed", || {
        !queue.deletes().is_empty()
    })
    .await;
    consumer.stop().await.unwrap();

    assert_eq!(handler.invocations().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_last_attempt_flag_is_derived_from_the_receive_count() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::always_successful();
    queue.push_batch(vec![test_message("message-1", "final delivery", Some(5))]);

    let consumer = build_consumer(
        queue.clone(),
        clock,
        handler.clone(),
        SQSConsumerConfig {
            max_receive_count: Some(5),
            ..test_config()
        },
    );
    consumer.start().await.unwrap();
    wait_for("the message to be deleted", || !queue.deletes().is_empty()).await;
    consumer.stop().await.unwrap();

    assert_eq!(
        handler.invocations(),
        vec![(
            "message-1".to_string(),
            DeliveryInfo {
                retry_count: 5,
                is_last_attempt: true,
            }
        )]
    );
}

#[test_log::test(tokio::test)]
async fn test_retry_defers_redelivery_with_a_backoff_visibility_timeout() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::new(vec![Ok(MessageOutcome::Retry { reason: None })]);
    let backoff_store = Arc::new(InMemoryBackoffStore::new(clock.clone()));

    queue.push_batch(vec![test_message("message-1", "retry me", Some(1))]);

    let mut consumer = build_consumer(
        queue.clone(),
        clock,
        handler.clone(),
        SQSConsumerConfig {
            backoff_base_delay: Some(5),
            backoff_base_delay_unit: Some(DelayUnit::Seconds),
            retry_strategy: Some(RetryStrategy::Exponential),
            ..test_config()
        },
    );
    consumer.set_backoff_store(backoff_store.clone());
    consumer.start().await.unwrap();
    wait_for("the visibility timeout to be re-set", || {
        !queue.visibility_changes().is_empty()
    })
    .await;
    consumer.stop().await.unwrap();

    // The first failure was recorded and the redelivery deferred by the
    // full base delay.
    assert_eq!(backoff_store.get_retry_count("message-1").await.unwrap(), 1);
    assert_eq!(
        queue.visibility_changes(),
        vec![(
            MessageHandle {
                message_id: Some("message-1".to_string()),
                receipt_handle: Some("receipt-message-1".to_string()),
            },
            5
        )]
    );
    assert_eq!(queue.deletes(), Vec::<Vec<MessageHandle>>::new());
}

#[test_log::test(tokio::test)]
async fn test_pre_marked_message_is_unmarked_when_classified_for_retry() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::new(vec![Ok(MessageOutcome::Retry { reason: None })]);
    let idempotency_store = Arc::new(InMemoryIdempotencyStore::new(clock.clone()));
    queue.push_batch(vec![test_message("message-1", "retry me", Some(1))]);

    let mut consumer = build_consumer(
        queue.clone(),
        clock,
        handler.clone(),
        SQSConsumerConfig {
            pre_mark_idempotent: true,
            ..test_config()
        },
    );
    consumer.set_idempotency_store(idempotency_store.clone());
    consumer.start().await.unwrap();
    settle(&queue).await;
    consumer.stop().await.unwrap();

    assert_eq!(handler.invocations().len(), 1);
    // The pre-mark was removed so the redelivery will be processed.
    assert!(!idempotency_store.has_processed("message-1").await.unwrap());
    assert_eq!(queue.deletes(), Vec::<Vec<MessageHandle>>::new());
}

#[test_log::test(tokio::test)]
async fn test_parallel_dispatch_settles_the_batch_with_one_delete_call() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::always_successful();
    queue.push_batch(
        (0..10)
            .map(|n| test_message(&format!("message-{n}"), "parallel", None))
            .collect(),
    );

    let consumer = build_consumer(
        queue.clone(),
        clock,
        handler.clone(),
        SQSConsumerConfig {
            process_in_parallel: true,
            ..test_config()
        },
    );
    consumer.start().await.unwrap();
    wait_for("the batch to be deleted", || !queue.deletes().is_empty()).await;
    consumer.stop().await.unwrap();

    assert_eq!(handler.invocations().len(), 10);
    let deletes = queue.deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].len(), 10);
}

#[test_log::test(tokio::test)]
async fn test_unrecognised_handler_errors_leave_the_message_for_redelivery() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::new(vec![Err(MessageHandlerError::HandlerFailure(
        Box::new(io::Error::other("an unexpected error occurred")),
    ))]);
    queue.push_batch(vec![test_message("message-1", "surprise", Some(1))]);

    let consumer = build_consumer(queue.clone(), clock, handler.clone(), test_config());
    consumer.start().await.unwrap();
    settle(&queue).await;
    consumer.stop().await.unwrap();

    assert_eq!(handler.invocations().len(), 1);
    assert_eq!(queue.deletes(), Vec::<Vec<MessageHandle>>::new());
}

#[test_log::test(tokio::test)]
async fn test_consumer_lifecycle_supports_restart_and_redundant_transitions() {
    let queue = MockQueueClient::new();
    let clock = Arc::new(TestClock::new(1_000));
    let handler = ScriptedHandler::always_successful();
    queue.push_batch(vec![test_message("message-1", "first run", None)]);

    let consumer = build_consumer(queue.clone(), clock, handler.clone(), test_config());
    consumer.start().await.unwrap();
    // A second start while running is a warning-level no-op.
    consumer.start().await.unwrap();
    wait_for("the first message to be deleted", || {
        !queue.deletes().is_empty()
    })
    .await;
    consumer.stop().await.unwrap();
    // A second stop while idle is also a no-op.
    consumer.stop().await.unwrap();

    // The consumer can be started again after stopping.
    queue.push_batch(vec![test_message("message-2", "second run", None)]);
    consumer.start().await.unwrap();
    wait_for("the second message to be deleted", || {
        queue.deletes().len() == 2
    })
    .await;
    consumer.stop().await.unwrap();

    assert_eq!(handler.invocations().len(), 2);
}
