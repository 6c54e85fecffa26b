pub mod aggregator;
pub mod backoff;
pub mod consumers;
pub mod idempotency;
pub mod redis;
pub mod time;
