use std::{
    collections::HashMap,
    fmt::{self, Display},
    str::FromStr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use redis::RedisError;

use crate::{redis::ConnectionWrapper, time::Clock};

/// The default key prefix for entries written by the Redis-backed
/// backoff store.
pub const DEFAULT_BACKOFF_KEY_PREFIX: &str = "backoff:";

// Field names for the Redis hash encoding of a backoff entry.
const FIELD_RETRY_COUNT: &str = "retryCount";
const FIELD_LAST_FAILURE_TIME: &str = "lastFailureTime";
const FIELD_BASE_DELAY: &str = "baseDelay";
const FIELD_BASE_DELAY_UNIT: &str = "baseDelayUnit";
const FIELD_STRATEGY: &str = "strategy";

/// The strategy used to compute the cool-down interval that follows
/// a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// The cool-down doubles with every recorded failure, the first
    /// cool-down equals the base delay.
    Exponential,
    /// The cool-down is the base delay after every failure.
    Fixed,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Fixed => "fixed",
        }
    }
}

impl Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "exponential" => Ok(RetryStrategy::Exponential),
            "fixed" => Ok(RetryStrategy::Fixed),
            _ => Err(format!("unknown retry strategy: {value}")),
        }
    }
}

/// The unit of a backoff base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl DelayUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayUnit::Milliseconds => "ms",
            DelayUnit::Seconds => "sec",
            DelayUnit::Minutes => "min",
            DelayUnit::Hours => "hour",
        }
    }

    /// Converts an amount expressed in this unit to milliseconds.
    pub fn to_millis(&self, amount: u64) -> u64 {
        let factor = match self {
            DelayUnit::Milliseconds => 1,
            DelayUnit::Seconds => 1000,
            DelayUnit::Minutes => 60 * 1000,
            DelayUnit::Hours => 60 * 60 * 1000,
        };
        amount.saturating_mul(factor)
    }
}

impl Display for DelayUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DelayUnit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ms" => Ok(DelayUnit::Milliseconds),
            "sec" => Ok(DelayUnit::Seconds),
            "min" => Ok(DelayUnit::Minutes),
            "hour" => Ok(DelayUnit::Hours),
            _ => Err(format!("unknown delay unit: {value}")),
        }
    }
}

/// A record of the failed processing attempts for a single message ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffEntry {
    /// The number of failures recorded so far, always at least 1 for
    /// an entry that exists.
    pub retry_count: u32,
    /// When the most recent failure was recorded, in milliseconds since
    /// the UNIX epoch.
    pub last_failure_ms: u64,
    /// The base delay amount, expressed in `base_delay_unit`.
    pub base_delay: u64,
    pub base_delay_unit: DelayUnit,
    pub strategy: RetryStrategy,
}

impl BackoffEntry {
    /// The earliest instant at which the message may be processed again,
    /// in milliseconds since the UNIX epoch.
    ///
    /// Cool-down intervals are deterministic given the entry, no jitter
    /// is applied.
    pub fn next_retry_instant(&self) -> u64 {
        let base_ms = self.base_delay_unit.to_millis(self.base_delay);
        let delay_ms = match self.strategy {
            RetryStrategy::Fixed => base_ms,
            RetryStrategy::Exponential => {
                let exponent = self.retry_count.saturating_sub(1).min(63);
                base_ms.saturating_mul(1u64 << exponent)
            }
        };
        self.last_failure_ms.saturating_add(delay_ms)
    }
}

/// An error produced by a backoff store backend.
#[derive(Debug)]
pub struct BackoffStoreError {
    message: String,
}

impl BackoffStoreError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

impl Display for BackoffStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backoff store error: {}", self.message)
    }
}

impl std::error::Error for BackoffStoreError {}

impl From<RedisError> for BackoffStoreError {
    fn from(err: RedisError) -> Self {
        Self::new(err.to_string())
    }
}

/// A store that tracks per-message cool-down intervals so that messages
/// which recently failed are not reprocessed before their backoff has
/// elapsed.
#[async_trait]
pub trait BackoffStore: Send + Sync {
    /// Returns true when no entry exists for the message ID or its
    /// cool-down interval has elapsed.
    async fn can_process(&self, message_id: &str) -> Result<bool, BackoffStoreError>;

    /// Records a failed processing attempt, creating an entry with a
    /// retry count of 1 or incrementing the existing count, and returns
    /// the new earliest retry instant in milliseconds since the UNIX
    /// epoch. The caller's delay unit is preserved in the entry.
    async fn record_failure(
        &self,
        message_id: &str,
        base_delay: u64,
        base_delay_unit: DelayUnit,
        strategy: RetryStrategy,
    ) -> Result<u64, BackoffStoreError>;

    /// The number of failures recorded for the message ID, 0 when no
    /// entry exists.
    async fn get_retry_count(&self, message_id: &str) -> Result<u32, BackoffStoreError>;

    /// Removes the entry for the message ID, called when a message is
    /// finally processed successfully.
    async fn clear(&self, message_id: &str) -> Result<(), BackoffStoreError>;
}

/// A backoff store that keeps entries in a map in process memory.
///
/// This store is volatile and per-process; replicas of a service do not
/// observe each other's failures. Use the Redis-backed store when the
/// cool-down must be shared.
pub struct InMemoryBackoffStore {
    entries: Mutex<HashMap<String, BackoffEntry>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl InMemoryBackoffStore {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl BackoffStore for InMemoryBackoffStore {
    async fn can_process(&self, message_id: &str) -> Result<bool, BackoffStoreError> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().expect("backoff entries mutex poisoned");
        Ok(entries
            .get(message_id)
            .map_or(true, |entry| now >= entry.next_retry_instant()))
    }

    async fn record_failure(
        &self,
        message_id: &str,
        base_delay: u64,
        base_delay_unit: DelayUnit,
        strategy: RetryStrategy,
    ) -> Result<u64, BackoffStoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().expect("backoff entries mutex poisoned");
        let entry = entries
            .entry(message_id.to_string())
            .or_insert_with(|| BackoffEntry {
                retry_count: 0,
                last_failure_ms: now,
                base_delay,
                base_delay_unit,
                strategy,
            });
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.last_failure_ms = now;
        entry.base_delay = base_delay;
        entry.base_delay_unit = base_delay_unit;
        entry.strategy = strategy;
        Ok(entry.next_retry_instant())
    }

    async fn get_retry_count(&self, message_id: &str) -> Result<u32, BackoffStoreError> {
        let entries = self.entries.lock().expect("backoff entries mutex poisoned");
        Ok(entries
            .get(message_id)
            .map_or(0, |entry| entry.retry_count))
    }

    async fn clear(&self, message_id: &str) -> Result<(), BackoffStoreError> {
        self.entries
            .lock()
            .expect("backoff entries mutex poisoned")
            .remove(message_id);
        Ok(())
    }
}

/// A backoff store backed by a Redis-compatible service, so that the
/// cool-down for a message is honoured by every replica of a service.
///
/// Each entry is a hash at `<prefix><message_id>` with the fields
/// `retryCount`, `lastFailureTime` (milliseconds since the UNIX epoch),
/// `baseDelay`, `baseDelayUnit` and `strategy`.
pub struct RedisBackoffStore {
    connection: ConnectionWrapper,
    key_prefix: String,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl RedisBackoffStore {
    /// Creates a new Redis-backed backoff store, using the `backoff:`
    /// key prefix when a prefix is not provided.
    pub fn new(
        connection: ConnectionWrapper,
        key_prefix: Option<String>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_BACKOFF_KEY_PREFIX.to_string()),
            clock,
        }
    }

    fn key(&self, message_id: &str) -> String {
        format!("{prefix}{message_id}", prefix = self.key_prefix)
    }
}

fn entry_from_hash(fields: &HashMap<String, String>) -> Result<BackoffEntry, BackoffStoreError> {
    let parse_field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| BackoffStoreError::new(format!("backoff entry is missing the {name} field")))
    };

    let retry_count = parse_field(FIELD_RETRY_COUNT)?
        .parse::<u32>()
        .map_err(|err| BackoffStoreError::new(format!("invalid retry count: {err}")))?;
    let last_failure_ms = parse_field(FIELD_LAST_FAILURE_TIME)?
        .parse::<u64>()
        .map_err(|err| BackoffStoreError::new(format!("invalid last failure time: {err}")))?;
    let base_delay = parse_field(FIELD_BASE_DELAY)?
        .parse::<u64>()
        .map_err(|err| BackoffStoreError::new(format!("invalid base delay: {err}")))?;
    let base_delay_unit = parse_field(FIELD_BASE_DELAY_UNIT)?
        .parse::<DelayUnit>()
        .map_err(BackoffStoreError::new)?;
    let strategy = parse_field(FIELD_STRATEGY)?
        .parse::<RetryStrategy>()
        .map_err(BackoffStoreError::new)?;

    Ok(BackoffEntry {
        retry_count,
        last_failure_ms,
        base_delay,
        base_delay_unit,
        strategy,
    })
}

#[async_trait]
impl BackoffStore for RedisBackoffStore {
    async fn can_process(&self, message_id: &str) -> Result<bool, BackoffStoreError> {
        let mut conn = self.connection.clone();
        let fields = conn.hgetall(&self.key(message_id)).await?;
        if fields.is_empty() {
            return Ok(true);
        }
        let entry = entry_from_hash(&fields)?;
        Ok(self.clock.now_ms() >= entry.next_retry_instant())
    }

    async fn record_failure(
        &self,
        message_id: &str,
        base_delay: u64,
        base_delay_unit: DelayUnit,
        strategy: RetryStrategy,
    ) -> Result<u64, BackoffStoreError> {
        let now = self.clock.now_ms();
        let mut conn = self.connection.clone();
        let record_failure_script = include_str!("../lua-scripts/record_failure.lua");

        let retry_count: i64 = conn
            .eval_script(
                record_failure_script,
                &[&self.key(message_id)],
                &[
                    &now.to_string(),
                    &base_delay.to_string(),
                    base_delay_unit.as_str(),
                    strategy.as_str(),
                ],
            )
            .await?;

        let entry = BackoffEntry {
            retry_count: retry_count.try_into().map_err(|_| {
                BackoffStoreError::new(format!("retry count out of range: {retry_count}"))
            })?,
            last_failure_ms: now,
            base_delay,
            base_delay_unit,
            strategy,
        };
        Ok(entry.next_retry_instant())
    }

    async fn get_retry_count(&self, message_id: &str) -> Result<u32, BackoffStoreError> {
        let mut conn = self.connection.clone();
        let count = conn
            .hget(&self.key(message_id), FIELD_RETRY_COUNT)
            .await?;
        match count {
            None => Ok(0),
            Some(count) => count
                .parse::<u32>()
                .map_err(|err| BackoffStoreError::new(format!("invalid retry count: {err}"))),
        }
    }

    async fn clear(&self, message_id: &str) -> Result<(), BackoffStoreError> {
        let mut conn = self.connection.clone();
        conn.del(&self.key(message_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

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

    #[test]
    fn test_delay_unit_conversion_to_milliseconds() {
        assert_eq!(DelayUnit::Milliseconds.to_millis(1500), 1500);
        assert_eq!(DelayUnit::Seconds.to_millis(5), 5000);
        assert_eq!(DelayUnit::Minutes.to_millis(2), 120_000);
        assert_eq!(DelayUnit::Hours.to_millis(1), 3_600_000);
    }

    #[test]
    fn test_delay_unit_and_strategy_round_trip_their_string_forms() {
        for unit in [
            DelayUnit::Milliseconds,
            DelayUnit::Seconds,
            DelayUnit::Minutes,
            DelayUnit::Hours,
        ] {
            assert_eq!(unit.as_str().parse::<DelayUnit>().unwrap(), unit);
        }
        for strategy in [RetryStrategy::Exponential, RetryStrategy::Fixed] {
            assert_eq!(
                strategy.as_str().parse::<RetryStrategy>().unwrap(),
                strategy
            );
        }
        assert!("fortnight".parse::<DelayUnit>().is_err());
        assert!("linear".parse::<RetryStrategy>().is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_can_process_is_true_for_unknown_message() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = InMemoryBackoffStore::new(clock);
        assert!(store.can_process("message-1").await.unwrap());
        assert_eq!(store.get_retry_count("message-1").await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_first_exponential_backoff_equals_base_delay() {
        let clock = Arc::new(TestClock::new(10_000));
        let store = InMemoryBackoffStore::new(clock.clone());

        let next_retry = store
            .record_failure(
                "message-1",
                5,
                DelayUnit::Seconds,
                RetryStrategy::Exponential,
            )
            .await
            .unwrap();

        assert_eq!(next_retry, 10_000 + 5_000);
        assert_eq!(store.get_retry_count("message-1").await.unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_exponential_next_retry_instant_is_non_decreasing() {
        let clock = Arc::new(TestClock::new(0));
        let store = InMemoryBackoffStore::new(clock.clone());

        let mut previous = 0;
        for n in 1..=10u32 {
            let next_retry = store
                .record_failure(
                    "message-1",
                    250,
                    DelayUnit::Milliseconds,
                    RetryStrategy::Exponential,
                )
                .await
                .unwrap();
            assert!(
                next_retry >= previous,
                "next retry instant decreased on failure {n}: {next_retry} < {previous}"
            );
            // The cool-down doubles with each failure while the clock
            // stands still.
            assert_eq!(next_retry, 250u64 * (1u64 << (n - 1)));
            previous = next_retry;
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_fixed_strategy_applies_the_base_delay_every_time() {
        let clock = Arc::new(TestClock::new(5_000));
        let store = InMemoryBackoffStore::new(clock.clone());

        for _ in 0..4 {
            let next_retry = store
                .record_failure("message-1", 2, DelayUnit::Seconds, RetryStrategy::Fixed)
                .await
                .unwrap();
            assert_eq!(next_retry, clock.now_ms() + 2_000);
            clock.advance(3_000);
        }
        assert_eq!(store.get_retry_count("message-1").await.unwrap(), 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_message_is_gated_until_the_cool_down_elapses() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = InMemoryBackoffStore::new(clock.clone());

        store
            .record_failure(
                "message-1",
                5000,
                DelayUnit::Milliseconds,
                RetryStrategy::Exponential,
            )
            .await
            .unwrap();

        assert!(!store.can_process("message-1").await.unwrap());
        clock.advance(4_999);
        assert!(!store.can_process("message-1").await.unwrap());
        clock.advance(1);
        assert!(store.can_process("message-1").await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_clear_removes_the_entry() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = InMemoryBackoffStore::new(clock);

        store
            .record_failure(
                "message-1",
                1,
                DelayUnit::Minutes,
                RetryStrategy::Exponential,
            )
            .await
            .unwrap();
        assert!(!store.can_process("message-1").await.unwrap());

        store.clear("message-1").await.unwrap();
        assert!(store.can_process("message-1").await.unwrap());
        assert_eq!(store.get_retry_count("message-1").await.unwrap(), 0);

        // Clearing an ID with no entry must not fail.
        store.clear("message-unknown").await.unwrap();
    }

    #[test]
    fn test_redis_hash_decoding_rejects_incomplete_entries() {
        let mut fields = HashMap::new();
        fields.insert(FIELD_RETRY_COUNT.to_string(), "3".to_string());
        fields.insert(FIELD_LAST_FAILURE_TIME.to_string(), "1000".to_string());
        fields.insert(FIELD_BASE_DELAY.to_string(), "5".to_string());
        fields.insert(FIELD_BASE_DELAY_UNIT.to_string(), "sec".to_string());

        let result = entry_from_hash(&fields);
        assert!(result.is_err());

        fields.insert(FIELD_STRATEGY.to_string(), "exponential".to_string());
        let entry = entry_from_hash(&fields).unwrap();
        assert_eq!(
            entry,
            BackoffEntry {
                retry_count: 3,
                last_failure_ms: 1000,
                base_delay: 5,
                base_delay_unit: DelayUnit::Seconds,
                strategy: RetryStrategy::Exponential,
            }
        );
        // retryCount = 3 means the third cool-down: base * 2^2.
        assert_eq!(entry.next_retry_instant(), 1000 + 20_000);
    }
}
