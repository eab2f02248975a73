//! Monotonic time as seen by the control core.
//!
//! Controllers never read a clock themselves. They are handed a [Millis]
//! timestamp on every step, which is what makes the timing-dependent
//! transitions testable without real delays.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Milliseconds since the clock origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Millis(pub u64);

impl Millis {
    /// Milliseconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Millis) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn plus(self, millis: u64) -> Millis {
        Millis(self.0.saturating_add(millis))
    }
}

pub trait Clock: Send + Sync + 'static {
    /// Time since the clock origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    fn now_millis(&self) -> Millis {
        Millis(self.now().as_millis() as u64)
    }
}

/// Wall clock backed by the tokio timer.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

#[cfg(feature = "tokio")]
impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

#[cfg(feature = "tokio")]
impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tokio")]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Virtual clock. Time only moves through [ManualClock::advance] or `sleep`,
/// which returns immediately after advancing.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_usec: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now_usec
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.now_usec.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_micros(1500));
        assert_eq!(clock.now_millis(), Millis(1));
        let _ = clock.sleep(Duration::from_millis(4));
        assert_eq!(clock.now(), Duration::from_micros(5500));
    }

    #[test]
    fn millis_since_saturates() {
        assert_eq!(Millis(10).since(Millis(4)), 6);
        assert_eq!(Millis(4).since(Millis(10)), 0);
        assert_eq!(Millis(4).plus(6), Millis(10));
    }
}
