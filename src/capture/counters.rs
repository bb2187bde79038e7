// Pipeline position counters and cancellation
//
// Each counter is a frame count with its own lock and condition variable.
// Counters only ever move forward. No code path holds two of these locks at
// once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A monotonically increasing frame count with a "new data" broadcast
pub struct PositionCounter {
    name: &'static str,
    value: Mutex<u64>,
    changed: Condvar,
}

impl PositionCounter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> u64 {
        *self.value.lock()
    }

    /// Store `value` and wake all waiters. Values behind the current one are
    /// ignored so the counter can never run backwards.
    pub fn advance(&self, value: u64) {
        let mut current = self.value.lock();
        debug_assert!(
            value >= *current,
            "{} counter moved backwards: {} -> {}",
            self.name,
            *current,
            value
        );
        if value > *current {
            *current = value;
        }
        drop(current);
        self.changed.notify_all();
    }

    /// Wake waiters without changing the value, so they re-check their
    /// stop conditions.
    pub fn notify(&self) {
        let _guard = self.value.lock();
        self.changed.notify_all();
    }

    /// Wait up to `timeout` for the value to move past `seen`, then return
    /// the current value whether or not it moved.
    pub fn wait_for_progress(&self, seen: u64, timeout: Duration) -> u64 {
        let mut value = self.value.lock();
        if *value == seen {
            self.changed.wait_for(&mut value, timeout);
        }
        *value
    }
}

/// The three pipeline positions
pub struct PipelinePositions {
    /// Frames `[0, captured)` are stamped and readable
    pub captured: PositionCounter,
    /// Frames handed to the archive writer
    pub archived: PositionCounter,
    /// Frames pushed to the browse handoff (real or substituted)
    pub browse_processed: PositionCounter,
}

impl PipelinePositions {
    pub fn new() -> Self {
        Self {
            captured: PositionCounter::new("captured"),
            archived: PositionCounter::new("archived"),
            browse_processed: PositionCounter::new("browse"),
        }
    }
}

impl Default for PipelinePositions {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation flag checked at every wake-up
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_advance_is_monotonic() {
        let counter = PositionCounter::new("test");
        counter.advance(5);
        assert_eq!(counter.get(), 5);
        counter.advance(5);
        assert_eq!(counter.get(), 5);
        counter.advance(9);
        assert_eq!(counter.get(), 9);
    }

    #[test]
    fn test_wait_times_out_and_returns_value() {
        let counter = PositionCounter::new("test");
        counter.advance(3);

        let start = Instant::now();
        let value = counter.wait_for_progress(3, Duration::from_millis(20));
        assert_eq!(value, 3);
        assert!(start.elapsed() >= Duration::from_millis(15));

        // Already past `seen`: no wait at all
        assert_eq!(counter.wait_for_progress(1, Duration::from_secs(10)), 3);
    }

    #[test]
    fn test_wait_wakes_on_advance() {
        let counter = Arc::new(PositionCounter::new("test"));
        let producer = counter.clone();

        let handle = thread::spawn(move || {
            for i in 1..=50 {
                producer.advance(i);
                thread::sleep(Duration::from_millis(1));
            }
        });

        let mut last = 0;
        while last < 50 {
            let value = counter.wait_for_progress(last, Duration::from_secs(5));
            assert!(value >= last, "counter went backwards");
            last = value;
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
