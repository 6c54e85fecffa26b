use std::fmt::Display;

use aws_sdk_sqs::{error::ProvideErrorMetadata, operation::receive_message::ReceiveMessageError};
use aws_smithy_runtime_api::http::StatusCode;
use http::StatusCode as StatusCodeHttp;

/// Determines whether a receive failure looks like an authentication or
/// endpoint connection problem rather than a transient service fault,
/// so the polling loop can apply the longer auth-error pause.
pub fn is_connection_error(err: &ReceiveMessageError, status: StatusCode) -> bool {
    let is_forbidden_response = status == StatusCode::from(StatusCodeHttp::FORBIDDEN);
    let err_code = err.code().unwrap_or("");
    let is_auth_err_code = err_code == "CredentialsError" || err_code == "UnknownEndpoint";
    is_forbidden_response || is_auth_err_code
}

/// An error from the queue client transport layer.
#[derive(Debug)]
pub struct QueueClientError {
    message: String,
    connection_error: bool,
}

impl QueueClientError {
    pub fn new(message: String) -> Self {
        Self {
            message,
            connection_error: false,
        }
    }

    /// Creates an error flagged as an authentication or endpoint
    /// connection problem.
    pub fn connection(message: String) -> Self {
        Self {
            message,
            connection_error: true,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        self.connection_error
    }
}

impl Display for QueueClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue client error: {}", self.message)
    }
}

impl std::error::Error for QueueClientError {}

/// Rejections produced when validating consumer configuration.
/// A consumer is never constructed from configuration that fails
/// validation, so an invalid configuration can never start polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingQueueUrl,
    InvalidMaxNumberOfMessages(i32),
    InvalidWaitTimeSeconds(i32),
    InvalidVisibilityTimeout(i32),
    InvalidMaxReceiveCount(u32),
    InvalidPollInterval(u64),
    InvalidMessageHandlerTimeout(u64),
    InvalidIdempotencyTtl(u64),
    InvalidBackoffBaseDelay(u64),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingQueueUrl => {
                write!(f, "a queue URL must be provided")
            }
            ConfigError::InvalidMaxNumberOfMessages(value) => write!(
                f,
                "max number of messages must be between 1 and 10, got {value}"
            ),
            ConfigError::InvalidWaitTimeSeconds(value) => write!(
                f,
                "wait time must be between 0 and 20 seconds, got {value}"
            ),
            ConfigError::InvalidVisibilityTimeout(value) => write!(
                f,
                "visibility timeout must not be negative, got {value}"
            ),
            ConfigError::InvalidMaxReceiveCount(value) => write!(
                f,
                "max receive count must be greater than zero when set, got {value}"
            ),
            ConfigError::InvalidPollInterval(value) => write!(
                f,
                "poll interval must be greater than zero milliseconds, got {value}"
            ),
            ConfigError::InvalidMessageHandlerTimeout(value) => write!(
                f,
                "message handler timeout must be greater than zero seconds when set, got {value}"
            ),
            ConfigError::InvalidIdempotencyTtl(value) => write!(
                f,
                "idempotency TTL must be greater than zero seconds, got {value}"
            ),
            ConfigError::InvalidBackoffBaseDelay(value) => write!(
                f,
                "backoff base delay must be greater than zero, got {value}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// An error surfaced by the consumer lifecycle operations.
#[derive(Debug)]
pub struct ConsumerError {
    message: String,
}

impl ConsumerError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

impl Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Consumer error: {}", self.message)
    }
}

impl std::error::Error for ConsumerError {}
