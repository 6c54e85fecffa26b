use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use redis::RedisError;
use tracing::debug;

use crate::{redis::ConnectionWrapper, time::Clock};

/// The default key prefix for entries written by the Redis-backed
/// idempotency store.
pub const DEFAULT_IDEMPOTENCY_KEY_PREFIX: &str = "idempotency:";

/// An error produced by an idempotency store backend.
#[derive(Debug)]
pub struct IdempotencyStoreError {
    message: String,
}

impl IdempotencyStoreError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

impl Display for IdempotencyStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idempotency store error: {}", self.message)
    }
}

impl std::error::Error for IdempotencyStoreError {}

impl From<RedisError> for IdempotencyStoreError {
    fn from(err: RedisError) -> Self {
        Self::new(err.to_string())
    }
}

/// A store that remembers which message IDs have already been processed
/// so that redeliveries of the same message can be suppressed.
///
/// Entries expire after a caller-provided TTL; an expired entry behaves
/// exactly like an absent one.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns true if and only if an unexpired entry exists
    /// for the given message ID.
    async fn has_processed(&self, message_id: &str) -> Result<bool, IdempotencyStoreError>;

    /// Creates or overwrites the entry for the given message ID with an
    /// expiry of `ttl_seconds` from now. Calling this for an existing
    /// entry resets its expiry.
    async fn mark_processed(
        &self,
        message_id: &str,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyStoreError>;

    /// Removes the entry for the given message ID, a no-op when
    /// no entry exists.
    async fn remove(&self, message_id: &str) -> Result<(), IdempotencyStoreError>;
}

/// An idempotency store that keeps entries in a map in process memory.
///
/// This store is volatile, all entries are lost on restart and entries
/// are not shared between replicas of a service. Use the Redis-backed
/// store when deduplication needs to span processes.
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, u64>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl InMemoryIdempotencyStore {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// The number of entries currently held, including entries that
    /// have expired but have not been swept yet.
    pub fn size(&self) -> usize {
        self.entries
            .lock()
            .expect("idempotency entries mutex poisoned")
            .len()
    }

    /// Removes all entries.
    pub fn clear_all(&self) {
        self.entries
            .lock()
            .expect("idempotency entries mutex poisoned")
            .clear();
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has_processed(&self, message_id: &str) -> Result<bool, IdempotencyStoreError> {
        let now = self.clock.now_ms();
        let mut entries = self
            .entries
            .lock()
            .expect("idempotency entries mutex poisoned");

        // Sweep expired entries opportunistically to bound memory,
        // there is no background task for this store.
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept, "swept expired idempotency entries");
        }

        Ok(entries.contains_key(message_id))
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyStoreError> {
        let expires_at = self
            .clock
            .now_ms()
            .saturating_add(ttl_seconds.saturating_mul(1000));
        self.entries
            .lock()
            .expect("idempotency entries mutex poisoned")
            .insert(message_id.to_string(), expires_at);
        Ok(())
    }

    async fn remove(&self, message_id: &str) -> Result<(), IdempotencyStoreError> {
        self.entries
            .lock()
            .expect("idempotency entries mutex poisoned")
            .remove(message_id);
        Ok(())
    }
}

/// An idempotency store backed by a Redis-compatible service,
/// for deduplicating deliveries across replicas of a service.
///
/// Each entry is a plain string value at `<prefix><message_id>` with a
/// server-enforced TTL, so no sweeping is needed on the client side.
pub struct RedisIdempotencyStore {
    connection: ConnectionWrapper,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    /// Creates a new Redis-backed idempotency store, using the
    /// `idempotency:` key prefix when a prefix is not provided.
    pub fn new(connection: ConnectionWrapper, key_prefix: Option<String>) -> Self {
        Self {
            connection,
            key_prefix: key_prefix
                .unwrap_or_else(|| DEFAULT_IDEMPOTENCY_KEY_PREFIX.to_string()),
        }
    }

    fn key(&self, message_id: &str) -> String {
        format!("{prefix}{message_id}", prefix = self.key_prefix)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has_processed(&self, message_id: &str) -> Result<bool, IdempotencyStoreError> {
        let mut conn = self.connection.clone();
        let exists = conn.exists(&self.key(message_id)).await?;
        Ok(exists)
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyStoreError> {
        let mut conn = self.connection.clone();
        // The value is opaque, only the existence of the key matters.
        conn.pset_ex(
            &self.key(message_id),
            "1",
            ttl_seconds.saturating_mul(1000),
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, message_id: &str) -> Result<(), IdempotencyStoreError> {
        let mut conn = self.connection.clone();
        conn.del(&self.key(message_id)).await?;
        Ok(())
    }
}
