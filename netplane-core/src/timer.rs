//! Background timers owned by a protocol instance.
//!
//! Timers fire on their own timeline, independent of the scheduler tick. Each
//! timer is a Tokio task that waits on an interval and a cancellation token.
//! Cancelling stops future waits and aborts callbacks at their next await.
//! A callback that already started is expected to check the owner's running
//! flag under the owner's lock.

use futures::Future;
use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// A periodic timer a protocol asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerSpec {
    pub name: &'static str,
    pub period: Duration,
}

impl TimerSpec {
    pub const fn new(name: &'static str, period: Duration) -> Self {
        Self { name, period }
    }
}

#[derive(Default)]
pub(crate) struct TimerSet {
    token: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
    specs: Vec<TimerSpec>,
}

impl TimerSet {
    /// Cancels any running timers and starts one task per spec. `fire` is
    /// called with the timer name each time a period elapses.
    ///
    /// Does nothing outside a Tokio runtime.
    pub fn start<F, Fut>(&mut self, specs: Vec<TimerSpec>, fire: F)
    where
        F: Fn(&'static str) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        if specs.is_empty() {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No Tokio runtime available, background timers not started");
                return;
            }
        };

        let token = CancellationToken::new();
        for spec in specs {
            if spec.period.is_zero() {
                tracing::warn!(timer = spec.name, "Ignoring timer with a zero period");
                continue;
            }
            self.specs.push(spec.clone());
            let token = token.child_token();
            let fire = fire.clone();
            self.handles.push(runtime.spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + spec.period, spec.period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = interval.tick() => fire(spec.name).await,
                    }
                }
            }));
        }
        if !self.handles.is_empty() {
            self.token = Some(token);
        }
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        self.specs.clear();
    }

    pub fn is_running(&self) -> bool {
        self.token.is_some()
    }

    pub fn specs(&self) -> &[TimerSpec] {
        &self.specs
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn fires_each_period_until_cancelled() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::default();
        let counter = fired.clone();
        timers.start(vec![TimerSpec::new("hello", Duration::from_secs(10))], move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(timers.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        timers.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!timers.is_running());
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn zero_period_timers_are_neither_run_nor_listed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut timers = TimerSet::default();
        timers.start(
            vec![
                TimerSpec::new("broken", Duration::ZERO),
                TimerSpec::new("hello", Duration::from_secs(10)),
            ],
            move |name| {
                let counter = counter.clone();
                async move {
                    assert_eq!(name, "hello");
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        assert_eq!(timers.specs(), &[TimerSpec::new("hello", Duration::from_secs(10))]);
        assert!(logs_contain("Ignoring timer with a zero period"));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        timers.start(vec![TimerSpec::new("broken", Duration::ZERO)], |_| async {});
        assert!(timers.specs().is_empty());
        assert!(!timers.is_running());
    }

    #[test]
    fn outside_a_runtime_nothing_starts() {
        let mut timers = TimerSet::default();
        timers.start(vec![TimerSpec::new("hello", Duration::from_secs(1))], |_| async {});
        assert!(!timers.is_running());
    }
}
