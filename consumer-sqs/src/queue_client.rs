use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::{
    error::SdkError,
    types::{DeleteMessageBatchRequestEntry, MessageSystemAttributeName},
    Client,
};
use aws_types::region::Region;
use conveyor_aws_helpers::{
    aws_regions::RegionProvider, clients::sqs_client, credentials::default_credentials_provider,
};
use conveyor_helpers::consumers::Message;
use tracing::{debug, error};

use crate::{
    errors::{is_connection_error, QueueClientError},
    types::{FromSQSMessage, MessageHandle, SQSMessageMetadata},
};

/// The SQS protocol limit on the number of entries in a single
/// DeleteMessageBatch call.
const MAX_DELETE_BATCH_ENTRIES: usize = 10;

/// The SQS ceiling for a message visibility timeout, in seconds (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: i32 = 43_200;

/// The operations the consumer runtime needs from an SQS-compatible
/// queue endpoint.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receives up to `max_messages` messages, long-polling for up to
    /// `wait_time_seconds`. Received messages are hidden from other
    /// consumers for `visibility_timeout` seconds.
    /// Returns an empty collection when no messages become available
    /// within the long-poll window and fails only on transport errors.
    async fn receive(
        &self,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<Message<SQSMessageMetadata>>, QueueClientError>;

    /// Deletes a batch of messages, best effort. Failures on individual
    /// entries are logged and not propagated; only transport-level
    /// failures surface as errors. Implementations split the entry list
    /// to honour the queue protocol's batch size limit.
    async fn delete_batch(&self, handles: &[MessageHandle]) -> Result<(), QueueClientError>;

    /// Resets the visibility timeout for a single message so that its
    /// next delivery is deferred. The value is clamped to the queue
    /// protocol's allowed range before the call.
    async fn change_visibility(
        &self,
        handle: &MessageHandle,
        visibility_timeout_seconds: i32,
    ) -> Result<(), QueueClientError>;
}

/// A queue client backed by an AWS SQS queue, or a compatible emulator
/// such as a LocalStack endpoint.
#[derive(Debug)]
pub struct SQSQueueClient {
    client: Arc<Client>,
    queue_url: String,
}

impl SQSQueueClient {
    pub fn new(client: Arc<Client>, queue_url: String) -> SQSQueueClient {
        SQSQueueClient { client, queue_url }
    }

    /// Builds a queue client for the given region with an optional
    /// custom endpoint, using the default credentials chain.
    /// Emulator endpoints accept placeholder credentials.
    pub async fn from_region(
        queue_url: String,
        aws_region: String,
        endpoint: Option<String>,
    ) -> SQSQueueClient {
        let credentials_provider =
            default_credentials_provider(Some(Region::new(aws_region.clone()))).await;
        let config = aws_config::defaults(BehaviorVersion::v2025_01_17())
            .region(RegionProvider::new(aws_region))
            .credentials_provider(credentials_provider)
            .load()
            .await;
        let client = sqs_client(&config, endpoint);
        SQSQueueClient::new(Arc::new(client), queue_url)
    }
}

#[async_trait]
impl QueueClient for SQSQueueClient {
    async fn receive(
        &self,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<Message<SQSMessageMetadata>>, QueueClientError> {
        let result = self
            .client
            .receive_message()
            .queue_url(self.queue_url.clone())
            .set_wait_time_seconds(Some(wait_time_seconds))
            .set_max_number_of_messages(Some(max_messages))
            .set_visibility_timeout(Some(visibility_timeout))
            // All system attributes are requested so the receive count is
            // always available for deriving per-delivery retry information.
            .set_message_system_attribute_names(Some(vec![MessageSystemAttributeName::All]))
            .set_message_attribute_names(Some(vec!["All".to_string()]))
            .send()
            .await;

        match result {
            Ok(output) => Ok(output
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(Message::from_sqs_message)
                .collect()),
            Err(SdkError::ServiceError(service_err)) => {
                let source = service_err.err();
                let raw = service_err.raw();
                if is_connection_error(source, raw.status()) {
                    Err(QueueClientError::connection(source.to_string()))
                } else {
                    Err(QueueClientError::new(source.to_string()))
                }
            }
            Err(err) => Err(QueueClientError::new(err.to_string())),
        }
    }

    async fn delete_batch(&self, handles: &[MessageHandle]) -> Result<(), QueueClientError> {
        if handles.is_empty() {
            debug!("skipping message deletion as there are no messages to delete");
            return Ok(());
        }

        for chunk in handles.chunks(MAX_DELETE_BATCH_ENTRIES) {
            let entries = chunk
                .iter()
                .map(|handle| {
                    DeleteMessageBatchRequestEntry::builder()
                        .set_id(handle.message_id.clone())
                        .set_receipt_handle(handle.receipt_handle.clone())
                        .build()
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| QueueClientError::new(err.to_string()))?;

            let output = self
                .client
                .delete_message_batch()
                .queue_url(self.queue_url.clone())
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|err| QueueClientError::new(err.to_string()))?;

            for failed_entry in output.failed() {
                error!(
                    entry_id = failed_entry.id(),
                    "failed to delete message from queue: {}",
                    failed_entry.message().unwrap_or("unknown error"),
                );
            }
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        handle: &MessageHandle,
        visibility_timeout_seconds: i32,
    ) -> Result<(), QueueClientError> {
        let final_visibility_timeout =
            visibility_timeout_seconds.clamp(0, MAX_VISIBILITY_TIMEOUT_SECONDS);
        self.client
            .change_message_visibility()
            .queue_url(self.queue_url.clone())
            .set_receipt_handle(handle.receipt_handle.clone())
            .visibility_timeout(final_visibility_timeout)
            .send()
            .await
            .map_err(|err| QueueClientError::new(err.to_string()))?;
        Ok(())
    }
}
