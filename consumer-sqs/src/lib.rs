pub mod errors;
pub mod message_consumer;
pub mod queue_client;
pub mod types;
