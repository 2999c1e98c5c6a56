//! Clock abstraction for retry and reconnect timers.
//!
//! Every delay in the broker client and the consumer supervisor goes through
//! a [`Clock`], so the retry policy can be exercised in tests without waiting
//! on the wall clock.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Source of delays for scheduled continuations.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that records every requested delay and returns after a single
/// scheduler yield instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Sum of all delays requested so far.
    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }

    /// Forget recorded delays.
    pub fn reset(&self) {
        self.sleeps.lock().clear();
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        tokio::task::yield_now().await;
    }
}
