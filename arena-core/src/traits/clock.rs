//! Time source for phase waits
//!
//! Waits are interruptible: a cancelled token ends the wait early with
//! [`Cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Sleep granularity for cancellation checks
const SLICE: Duration = Duration::from_millis(20);

/// Wait ended by an operator abort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run cancelled")]
pub struct Cancelled;

/// Shared abort flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail fast if cancelled
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Monotonic time source
pub trait Clock {
    /// Time since the clock was created
    fn elapsed(&self) -> Duration;

    /// Wait for `duration` unless cancelled first
    fn wait(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Cancelled>;
}

/// Wall-clock time with real sleeps
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wait(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLICE));
        }
    }
}

/// Virtual time that advances instantly
///
/// Used for dry runs and tests. Clones share the same timeline.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    now: Arc<Mutex<Duration>>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for SimulatedClock {
    fn elapsed(&self) -> Duration {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }

    fn wait(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Cancelled> {
        cancel.check()?;
        self.advance(duration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_advances() {
        let clock = SimulatedClock::new();
        let shared = clock.clone();
        let cancel = CancelToken::new();

        clock.wait(Duration::from_secs(3), &cancel).unwrap();
        shared.advance(Duration::from_millis(500));
        assert_eq!(clock.elapsed(), Duration::from_millis(3500));
    }

    #[test]
    fn test_cancelled_wait() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let clock = SimulatedClock::new();
        assert_eq!(clock.wait(Duration::from_secs(1), &cancel), Err(Cancelled));
        assert_eq!(clock.elapsed(), Duration::ZERO);

        let clock = SystemClock::new();
        let start = Instant::now();
        assert_eq!(clock.wait(Duration::from_secs(10), &cancel), Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_system_clock_waits() {
        let clock = SystemClock::new();
        let cancel = CancelToken::new();
        clock.wait(Duration::from_millis(30), &cancel).unwrap();
        assert!(clock.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let clock = SystemClock::new();
        assert_eq!(clock.wait(Duration::from_secs(10), &cancel), Err(Cancelled));
        handle.join().unwrap();
    }
}
