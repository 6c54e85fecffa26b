use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display},
    hash::Hash,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{oneshot, Mutex, MutexGuard},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info_span, warn, Instrument};

/// Configuration for a double-buffered aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// The interval between automatic flushes, in milliseconds.
    pub flush_interval_ms: u64,
    /// When set, a flush is also triggered as soon as the active buffer
    /// holds this many keys.
    pub max_buffer_size: Option<usize>,
}

/// An error produced by a flush sink.
#[derive(Debug)]
pub struct FlushError {
    message: String,
}

impl FlushError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

impl Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flush error: {}", self.message)
    }
}

impl Error for FlushError {}

/// Errors surfaced by aggregator operations.
#[derive(Debug)]
pub enum AggregatorError {
    /// The configuration was rejected at construction.
    InvalidConfig(String),
    /// The aggregator was stopped, no further writes are accepted.
    Stopped,
    /// The flush sink failed; the batch that could not be written has
    /// been returned to the active buffer so no data is lost.
    FlushFailed(FlushError),
}

impl Display for AggregatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorError::InvalidConfig(reason) => {
                write!(f, "invalid aggregator configuration: {reason}")
            }
            AggregatorError::Stopped => {
                write!(f, "aggregator has been stopped and no longer accepts writes")
            }
            AggregatorError::FlushFailed(err) => {
                write!(f, "aggregator flush failed: {err}")
            }
        }
    }
}

impl Error for AggregatorError {}

/// The destination for flushed buffer contents, supplied by the caller.
/// A typical implementation performs one bulk write per call.
#[async_trait]
pub trait FlushSink<K, V>: Send + Sync {
    /// Writes one batch of aggregated entries.
    /// When this returns an error the batch is returned to the
    /// aggregator's active buffer and will be included in the next flush.
    async fn flush(&self, entries: &HashMap<K, V>) -> Result<(), FlushError>;
}

// The pair of buffers behind an aggregator. Incoming writes only ever
// touch the active buffer and flushes only ever read the other one.
struct BufferPair<K, V> {
    a: HashMap<K, V>,
    b: HashMap<K, V>,
    active_is_a: bool,
}

impl<K: Eq + Hash, V> BufferPair<K, V> {
    fn new() -> Self {
        Self {
            a: HashMap::new(),
            b: HashMap::new(),
            active_is_a: true,
        }
    }

    fn active(&self) -> &HashMap<K, V> {
        if self.active_is_a {
            &self.a
        } else {
            &self.b
        }
    }

    fn active_mut(&mut self) -> &mut HashMap<K, V> {
        if self.active_is_a {
            &mut self.a
        } else {
            &mut self.b
        }
    }

    fn flush_mut(&mut self) -> &mut HashMap<K, V> {
        if self.active_is_a {
            &mut self.b
        } else {
            &mut self.a
        }
    }

    fn swap(&mut self) {
        self.active_is_a = !self.active_is_a;
    }
}

struct TimerTask {
    kill: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Collapses many keyed updates into one bulk write per flush.
///
/// Updates land in the active buffer while flushes drain the other
/// buffer of the pair, so writers are never blocked on the sink.
/// A flush is triggered by the periodic timer started with
/// [`DoubleBufferedAggregator::start`], by the active buffer reaching the
/// configured maximum size, or explicitly through
/// [`DoubleBufferedAggregator::force_flush`]; concurrent triggers are
/// coalesced so at most one flush runs at a time.
pub struct DoubleBufferedAggregator<K, V> {
    sink: Arc<dyn FlushSink<K, V>>,
    buffers: StdMutex<BufferPair<K, V>>,
    // Serialises flushes. Automatic triggers take this with try_lock so
    // they coalesce with an in-flight flush; the final flush on stop
    // waits its turn.
    flush_guard: Mutex<()>,
    stopped: AtomicBool,
    timer_task: StdMutex<Option<TimerTask>>,
    config: AggregatorConfig,
}

impl<K, V> DoubleBufferedAggregator<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a new aggregator that flushes through the given sink.
    pub fn new(
        sink: Arc<dyn FlushSink<K, V>>,
        config: AggregatorConfig,
    ) -> Result<Self, AggregatorError> {
        if config.flush_interval_ms == 0 {
            return Err(AggregatorError::InvalidConfig(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        if let Some(max_buffer_size) = config.max_buffer_size {
            if max_buffer_size == 0 {
                return Err(AggregatorError::InvalidConfig(
                    "max buffer size must be greater than zero when set".to_string(),
                ));
            }
        }
        Ok(Self {
            sink,
            buffers: StdMutex::new(BufferPair::new()),
            flush_guard: Mutex::new(()),
            stopped: AtomicBool::new(false),
            timer_task: StdMutex::new(None),
            config,
        })
    }

    /// Schedules the periodic flush timer.
    /// Calling this on an aggregator whose timer is already running
    /// is a no-op.
    pub fn start(self: Arc<Self>) {
        let mut timer_task = self
            .timer_task
            .lock()
            .expect("aggregator timer mutex poisoned");
        if timer_task.is_some() {
            warn!("aggregator timer is already running, ignoring start request");
            return;
        }

        let (kill, kill_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn({
            // self is shared between the timer task and callers, so the
            // Arc synchronisation primitive is used to share it.
            let me = Arc::clone(&self);
            async move {
                tokio::select! {
                    _ = me.run_flush_timer() => {},
                    _ = kill_rx => {}
                }
            }
            .instrument(info_span!("aggregator_flush_timer"))
        });
        *timer_task = Some(TimerTask { kill, handle });
    }

    /// Cancels the periodic timer and performs a final flush.
    /// The final flush waits for any in-flight flush to finish first,
    /// so a timer firing mid-teardown cannot race it.
    /// Writes arriving after this returns are rejected.
    pub async fn stop(&self) -> Result<(), AggregatorError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("aggregator is already stopped, ignoring stop request");
            return Ok(());
        }

        let timer_task = {
            let mut timer_task = self
                .timer_task
                .lock()
                .expect("aggregator timer mutex poisoned");
            timer_task.take()
        };
        if let Some(TimerTask { kill, handle }) = timer_task {
            // The timer task may have already exited, in which case there
            // is no receiver for the kill signal.
            let _ = kill.send(());
            if let Err(err) = handle.await {
                error!("aggregator timer task did not shut down cleanly: {err}");
            }
        }

        let guard = self.flush_guard.lock().await;
        self.flush_under_guard(guard).await
    }

    /// Writes a value into the active buffer, last writer wins on the key.
    /// When the write fills the active buffer up to the configured maximum
    /// size, a flush is triggered before returning and any flush failure
    /// is propagated to this caller.
    pub async fn set(&self, key: K, value: V) -> Result<(), AggregatorError> {
        self.ensure_accepting_writes()?;
        let should_flush = {
            let mut buffers = self.buffers.lock().expect("aggregator buffers mutex poisoned");
            let active = buffers.active_mut();
            active.insert(key, value);
            self.reached_flush_threshold(active.len())
        };
        if should_flush {
            self.flush_coalesced().await?;
        }
        Ok(())
    }

    /// Combines a value with the one already buffered for the key using
    /// the provided reducer, or stores the value as-is when the key is
    /// not present in the active buffer.
    /// The reducer receives the previous value first and the incoming
    /// value second.
    pub async fn update<F>(&self, key: K, value: V, reducer: F) -> Result<(), AggregatorError>
    where
        F: FnOnce(&V, &V) -> V,
    {
        self.ensure_accepting_writes()?;
        let should_flush = {
            let mut buffers = self.buffers.lock().expect("aggregator buffers mutex poisoned");
            let active = buffers.active_mut();
            let next = match active.get(&key) {
                Some(previous) => reducer(previous, &value),
                None => value,
            };
            active.insert(key, next);
            self.reached_flush_threshold(active.len())
        };
        if should_flush {
            self.flush_coalesced().await?;
        }
        Ok(())
    }

    /// The number of distinct keys currently in the active buffer.
    pub fn size(&self) -> usize {
        self.buffers
            .lock()
            .expect("aggregator buffers mutex poisoned")
            .active()
            .len()
    }

    /// Triggers a flush of the active buffer.
    /// Returns immediately when another flush is already in progress.
    pub async fn force_flush(&self) -> Result<(), AggregatorError> {
        self.ensure_accepting_writes()?;
        self.flush_coalesced().await
    }

    fn ensure_accepting_writes(&self) -> Result<(), AggregatorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AggregatorError::Stopped);
        }
        Ok(())
    }

    fn reached_flush_threshold(&self, active_len: usize) -> bool {
        self.config
            .max_buffer_size
            .map_or(false, |max_buffer_size| active_len >= max_buffer_size)
    }

    async fn run_flush_timer(&self) {
        let mut interval = time::interval(Duration::from_millis(self.config.flush_interval_ms));
        // The first tick of a tokio interval completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = self.flush_coalesced().await {
                // There is no caller to propagate to for a timer-triggered
                // flush; the batch stays buffered for the next attempt.
                error!("periodic flush failed: {err}");
            }
        }
    }

    async fn flush_coalesced(&self) -> Result<(), AggregatorError> {
        let guard = match self.flush_guard.try_lock() {
            Ok(guard) => guard,
            // A flush is already in progress and will drain the buffer.
            Err(_) => return Ok(()),
        };
        self.flush_under_guard(guard).await
    }

    async fn flush_under_guard(
        &self,
        _guard: MutexGuard<'_, ()>,
    ) -> Result<(), AggregatorError> {
        let batch = {
            let mut buffers = self.buffers.lock().expect("aggregator buffers mutex poisoned");
            if buffers.active().is_empty() {
                return Ok(());
            }
            // New writes now land in the other buffer while the sink
            // works through this one.
            buffers.swap();
            mem::take(buffers.flush_mut())
        };

        match self.sink.flush(&batch).await {
            Ok(()) => {
                debug!(keys = batch.len(), "flushed aggregated entries");
                Ok(())
            }
            Err(err) => {
                let mut buffers = self.buffers.lock().expect("aggregator buffers mutex poisoned");
                let active = buffers.active_mut();
                for (key, value) in batch {
                    // Writes that arrived while the flush was running are
                    // newer than the failed batch and win on collision.
                    active.entry(key).or_insert(value);
                }
                Err(AggregatorError::FlushFailed(err))
            }
        }
    }
}
