//! Simulation time.
//!
//! Hold times and advertisement intervals are simulation parameters. All
//! elapsed-time decisions are made by comparing captured [`SimTime`] stamps,
//! never by counting ticks, so late or irregular ticks are tolerated.

use std::{
    fmt::Display,
    ops::Add,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Time elapsed since the simulation started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(Duration);

impl SimTime {
    pub const ZERO: SimTime = SimTime(Duration::ZERO);

    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub const fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    pub const fn as_duration(self) -> Duration {
        self.0
    }

    /// The time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: SimTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> Self::Output {
        SimTime(self.0.saturating_add(rhs))
    }
}

impl Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}

/// A source of simulation time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SimTime;
}

pub type SharedClock = Arc<dyn Clock>;

/// A clock that only moves when told to. Used for deterministic simulations
/// and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set(&self, time: SimTime) {
        self.millis
            .store(time.as_duration().as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) -> SimTime {
        let millis = by.as_millis() as u64;
        let now = self.millis.fetch_add(millis, Ordering::SeqCst) + millis;
        SimTime::from_millis(now)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SimTime {
        SimTime::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// A clock driven by the Tokio runtime. Honors paused time in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> SimTime {
        SimTime(self.origin.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), SimTime::ZERO);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), SimTime::from_secs(5));
        clock.set(SimTime::from_secs(181));
        assert_eq!(clock.now(), SimTime::from_secs(181));
    }

    #[test]
    fn elapsed_time_saturates() {
        let early = SimTime::from_secs(10);
        let late = SimTime::from_secs(25);
        assert_eq!(late.saturating_since(early), Duration::from_secs(15));
        assert_eq!(early.saturating_since(late), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.now(), SimTime::from_secs(30));
    }
}
