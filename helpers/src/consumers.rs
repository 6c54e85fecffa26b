use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Debug, Display},
    sync::Arc,
};
use tokio::time::error::Elapsed;
use tracing::{debug, info_span, Instrument};

/// Provides a trait for a message consumer
/// that listens for messages on a queue
/// or message broker and fires registered
/// event handlers.
#[async_trait]
pub trait MessageConsumer<Metadata: Debug + Clone> {
    type Error;

    /// Registers the handler that is dispatched for each message
    /// received from the queue or message broker.
    fn register_handler(&mut self, handler: Arc<dyn MessageHandler<Metadata> + Send + Sync>);

    /// Starts the message consumer and listens for messages on the queue
    /// or message broker.
    async fn start(&self) -> Result<(), Self::Error>;

    /// Signals the consumer to stop and waits for any in-flight work
    /// to run to completion.
    async fn stop(&self) -> Result<(), Self::Error>;
}

/// A message that has been received from a message service.
#[derive(Debug, Clone)]
pub struct Message<Metadata: Debug + Clone> {
    /// A unique identifier for the message.
    pub message_id: String,
    /// The contents of the message.
    /// The consumer runtime treats this as opaque, handlers are free
    /// to parse it however they see fit.
    pub body: Option<String>,
    /// An MD5 digest of the message body string,
    /// can be used to verify that the original message
    /// was not corrupted.
    /// When set, this is expected to be computed by the sender
    /// or the message service (e.g. Amazon SQS)
    /// the message was received from.
    pub md5_of_body: Option<String>,
    /// Additional metadata about the message,
    /// this will often have information specific
    /// to the message service used to deliver the message.
    pub metadata: Metadata,
}

/// Information about the current delivery of a message, derived from
/// attributes maintained by the message service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// The number of times the message service has delivered this
    /// message so far, 0 when the service did not report a count.
    pub retry_count: u32,
    /// Whether this delivery is the final attempt before the message
    /// service stops redelivering the message, based on the consumer's
    /// configured maximum receive count.
    pub is_last_attempt: bool,
}

/// The terminal classification of a single message delivery.
/// The consumer runtime produces exactly one of these per message
/// per delivery and settles the message accordingly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The message was processed and must be deleted from the queue.
    Success,
    /// A transient fault occurred, the message is left on the queue
    /// so it will be redelivered.
    Retry { reason: Option<String> },
    /// A permanent fault occurred, the message is deleted from the queue
    /// and will never be reprocessed.
    Failure { reason: Option<String> },
}

/// A typed error that handlers can return inside
/// [`MessageHandlerError::HandlerFailure`] as an alternative surface to
/// returning a [`MessageOutcome`] directly.
/// The consumer runtime recovers this type by downcast when classifying
/// handler results; `Transient` maps to a retry and `Fatal` maps to a
/// permanent failure.
#[derive(Debug)]
pub enum MessageProcessingError {
    Transient(String),
    Fatal(String),
}

impl Display for MessageProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageProcessingError::Transient(reason) => {
                write!(f, "transient processing error: {reason}")
            }
            MessageProcessingError::Fatal(reason) => {
                write!(f, "fatal processing error: {reason}")
            }
        }
    }
}

impl Error for MessageProcessingError {}

// Provides a custom error type to be used for failures
// within message handlers.
#[derive(Debug)]
pub enum MessageHandlerError {
    MissingHandler,
    Timeout(Elapsed),
    HandlerFailure(Box<dyn Error + Send + Sync + 'static>),
}

impl Display for MessageHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageHandlerError::MissingHandler => write!(
                f,
                "message handler failed: a handler must be registered to process messages"
            ),
            MessageHandlerError::Timeout(elapsed_error) => {
                write!(f, "message handler failed: timeout {elapsed_error}")
            }
            MessageHandlerError::HandlerFailure(handler_error) => {
                write!(f, "message handler failed: {handler_error}")
            }
        }
    }
}

#[async_trait]
pub trait MessageHandler<Metadata: Debug + Clone> {
    async fn handle(
        &self,
        message: &Message<Metadata>,
        delivery: &DeliveryInfo,
    ) -> Result<MessageOutcome, MessageHandlerError>;
}

impl<Metadata: Debug + Clone> Debug for dyn MessageHandler<Metadata> + Send + Sync {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MessageHandler<{}>", std::any::type_name::<Metadata>())
    }
}

/// A message that has been received from a message service and has been routed
/// to a specific handler. This is for JSON messages that contain a route key
/// that can be used to route the message to a specific handler for processing
/// application-level events.
#[derive(Debug, Clone)]
pub struct RoutedMessage<Metadata: Debug + Clone> {
    /// A unique identifier for the message.
    pub message_id: String,
    /// The route value that was used to route the message to this handler.
    pub route: String,
    /// The parsed contents of the message.
    pub body: Value,
    /// Additional metadata about the message,
    /// this will often have information specific
    /// to the message service used to deliver the message.
    pub metadata: Metadata,
}

impl<Metadata: Debug + Clone> RoutedMessage<Metadata> {
    /// Create a new routed message from an original message from a message service
    /// and the parsed JSON message body object.
    pub fn from_message_parts(message: &Message<Metadata>, route: &str, object: &Value) -> Self {
        Self {
            message_id: message.message_id.clone(),
            route: route.to_string(),
            body: object.clone(),
            metadata: message.metadata.clone(),
        }
    }
}

/// A message handler that can be used to handle routed messages.
/// This should be implemented by applications that want to dispatch
/// different kinds of events carried over the same queue to dedicated
/// handlers, as well as raw messages received from a message service.
#[async_trait]
pub trait RoutedMessageHandler<Metadata: Debug + Clone> {
    /// Handle a routed message.
    async fn handle(
        &self,
        message: &RoutedMessage<Metadata>,
        delivery: &DeliveryInfo,
    ) -> Result<MessageOutcome, MessageHandlerError>;
    /// Handle a raw message received from a message service.
    async fn handle_raw_message(
        &self,
        message: &Message<Metadata>,
        delivery: &DeliveryInfo,
    ) -> Result<MessageOutcome, MessageHandlerError>;
}

/// An implementation of a message handler that can be used with a message consumer
/// to route messages to appropriate handlers based on routing keys in the message body,
/// when the message body is a JSON payload.
/// Routing is skipped if there are no routes registered, which is the default
/// to allow this implementation to be used for passing through the original messages.
pub struct MessageHandlerWithRouter<Metadata: Debug + Clone> {
    routes: HashMap<String, Arc<dyn RoutedMessageHandler<Metadata> + Send + Sync>>,
    // The key in the JSON message body object that contains the route value.
    route_key: String,
    // The default route value to use if there is no match for the route key value
    // in the message body.
    // This is tried before sending the original message(s) to the fallback handler.
    default_route_value: Option<String>,
    // A fallback handler that will be used if no routes are registered,
    // the `handle_raw_message` method will be called with the original message.
    fallback_handler: Arc<dyn RoutedMessageHandler<Metadata> + Send + Sync>,
}

impl<Metadata: Debug + Clone> MessageHandlerWithRouter<Metadata> {
    /// Create a new message handler with a fallback handler.
    ///
    /// # Arguments
    ///
    /// * `route_key` - The key in the JSON message body object that contains the route value, defaults to `event`.
    /// * `default_route_value` - The default route value to use if there is no match for the route key value
    ///   in the message body.
    /// * `fallback_handler` - A fallback handler that will be used if no routes are registered
    ///   or a default route value is not set. The `handle_raw_message` method will be called
    ///   with the original message.
    pub fn new(
        route_key: Option<String>,
        default_route_value: Option<String>,
        fallback_handler: Arc<dyn RoutedMessageHandler<Metadata> + Send + Sync>,
    ) -> Self {
        Self {
            routes: HashMap::new(),
            route_key: route_key.unwrap_or_else(|| "event".to_string()),
            default_route_value,
            fallback_handler,
        }
    }

    pub fn register_route(
        &mut self,
        route: String,
        handler: Arc<dyn RoutedMessageHandler<Metadata> + Send + Sync>,
    ) {
        self.routes.insert(route, handler);
    }

    fn match_route(
        &self,
        message: &Message<Metadata>,
        object: Value,
        route_key: &str,
    ) -> Option<(
        Arc<dyn RoutedMessageHandler<Metadata> + Send + Sync>,
        RoutedMessage<Metadata>,
    )> {
        if let Some(Value::String(route)) = object.get(route_key) {
            if let Some(handler) = self.routes.get(route) {
                debug!("matched on route \"{route_key}={route}\"");
                let routed_message = RoutedMessage::from_message_parts(message, route, &object);
                return Some((handler.clone(), routed_message));
            }
        }

        if let Some(default_route_value) = &self.default_route_value {
            if let Some(handler) = self.routes.get(default_route_value) {
                debug!("matched on default route \"{route_key}={default_route_value}\"");
                let routed_message =
                    RoutedMessage::from_message_parts(message, default_route_value, &object);
                return Some((handler.clone(), routed_message));
            } else {
                debug!("no handler found for default route \"{route_key}={default_route_value}\"");
                return None;
            }
        }

        debug!(
            "route key \"{route_key}\" not found in message JSON object \
            and there is no default route"
        );
        None
    }
}

#[async_trait]
impl<Metadata: Debug + Clone + Send + Sync> MessageHandler<Metadata>
    for MessageHandlerWithRouter<Metadata>
{
    async fn handle(
        &self,
        message: &Message<Metadata>,
        delivery: &DeliveryInfo,
    ) -> Result<MessageOutcome, MessageHandlerError> {
        if self.routes.is_empty() {
            return self
                .fallback_handler
                .handle_raw_message(message, delivery)
                .await;
        }

        let route_key = &self.route_key;
        let match_result_opt = match serde_json::from_str::<Value>(
            message.body.as_deref().unwrap_or_default(),
        ) {
            Ok(Value::Object(object)) => {
                self.match_route(message, Value::Object(object), route_key)
            }
            Ok(_) => {
                debug!("message body is not a JSON object, original message will be passed to raw message handler");
                None
            }
            Err(e) => {
                debug!("failed to parse message body as JSON, original message will be passed to raw message handler: {e}");
                None
            }
        };

        if let Some((handler, routed_message)) = match_result_opt {
            handler
                .handle(&routed_message, delivery)
                .instrument(info_span!(
                    "routed_message_handler",
                    route = routed_message.route,
                    message_id = routed_message.message_id,
                ))
                .await
        } else {
            self.fallback_handler
                .handle_raw_message(message, delivery)
                .await
        }
    }
}
