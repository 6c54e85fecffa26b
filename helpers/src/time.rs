use std::time::{SystemTime, UNIX_EPOCH};

/// A trait for a clock that can provide the current time
/// as a UNIX timestamp in milliseconds.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// A default implementation of a clock that uses the system time.
///
/// # Examples
///
/// ```
/// # use conveyor_helpers::time::{Clock, DefaultClock};
///
/// let clock = DefaultClock::new();
/// let now = clock.now_ms();
/// ```
pub struct DefaultClock {}

impl DefaultClock {
    /// Creates a new instance of the default clock
    /// that uses system time.
    pub fn new() -> Self {
        DefaultClock {}
    }
}

impl Default for DefaultClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for DefaultClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }
}
