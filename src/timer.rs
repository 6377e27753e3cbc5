//! Shared repeating timer.
//!
//! One facility serves every guarded job in the process. Each registration
//! owns its task and runs it on its own tokio task until canceled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Work run on every tick. Must return quickly.
pub trait PeriodicTask: Send + Sync + 'static {
    fn run(&self);
}

/// Process-wide registry of repeating tasks.
#[derive(Debug, Default)]
pub struct TimerFacility {
    next_id: AtomicU64,
    registrations: Mutex<HashMap<u64, CancellationToken>>,
}

impl TimerFacility {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `task` every `period`, first after `delay`.
    ///
    /// Must be called from within a tokio runtime. The registration keeps the
    /// task alive until the returned handle cancels it.
    pub fn schedule_at_fixed_rate<T: PeriodicTask>(
        self: &Arc<Self>,
        task: Arc<T>,
        delay: Duration,
        period: Duration,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.lock().insert(id, token.clone());

        let facility = Arc::downgrade(self);
        let task_token = token.clone();
        let period = period.clamp(MIN_PERIOD, MAX_PERIOD);
        let delay = delay.min(MAX_PERIOD);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick(Instant::now(), delay), period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if task_token.is_cancelled() {
                            break;
                        }
                        task.run();
                    }
                }
            }

            drop(task);
            if let Some(facility) = facility.upgrade() {
                facility.forget(id);
            }
            tracing::debug!(timer_id = id, "periodic task stopped");
        });

        tracing::debug!(
            timer_id = id,
            delay_ms = delay.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "periodic task scheduled"
        );

        TimerHandle {
            id,
            token,
            facility: Arc::downgrade(self),
        }
    }

    /// Number of registrations that have not been canceled yet.
    #[allow(dead_code)]
    pub fn active(&self) -> usize {
        self.lock().len()
    }

    fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Deadline of the first tick. Never panics on overflow.
fn first_tick(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or(now)
}

/// Cancels one registration. Dropping the handle does not cancel.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    token: CancellationToken,
    facility: Weak<TimerFacility>,
}

impl TimerHandle {
    /// Stop the task. A tick already running finishes; no new tick starts.
    pub fn cancel(&self) {
        self.token.cancel();
        if let Some(facility) = self.facility.upgrade() {
            facility.forget(self.id);
        }
    }

    #[allow(dead_code)]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        ticks: AtomicUsize,
    }

    impl PeriodicTask for Counter {
        fn run(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Counter {
        fn ticks(&self) -> usize {
            self.ticks.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_ticks_repeat_after_delay() {
        let timer = TimerFacility::new();
        let counter = Arc::new(Counter::default());
        let handle = timer.schedule_at_fixed_rate(
            counter.clone(),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(counter.ticks(), 0, "no tick before the initial delay");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(counter.ticks() >= 3, "got {} ticks", counter.ticks());
        handle.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_ticks() {
        let timer = TimerFacility::new();
        let counter = Arc::new(Counter::default());
        let handle = timer.schedule_at_fixed_rate(
            counter.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.cancel();
        assert!(handle.is_cancelled());
        let at_cancel = counter.ticks();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(counter.ticks() <= at_cancel + 1);
    }

    #[tokio::test]
    async fn test_cancel_before_first_tick() {
        let timer = TimerFacility::new();
        let counter = Arc::new(Counter::default());
        let handle = timer.schedule_at_fixed_rate(
            counter.clone(),
            Duration::from_millis(30),
            Duration::from_millis(30),
        );
        assert_eq!(timer.active(), 1);

        handle.cancel();
        assert_eq!(timer.active(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.ticks(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let timer = TimerFacility::new();
        let handle = timer.schedule_at_fixed_rate(
            Arc::new(Counter::default()),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        handle.cancel();
        handle.cancel();
        assert_eq!(timer.active(), 0);
    }

    #[tokio::test]
    async fn test_registration_releases_task() {
        let timer = TimerFacility::new();
        let counter = Arc::new(Counter::default());
        let handle = timer.schedule_at_fixed_rate(
            counter.clone(),
            Duration::from_millis(5),
            Duration::from_millis(5),
        );
        assert_eq!(Arc::strong_count(&counter), 2);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[tokio::test]
    async fn test_huge_delay_keeps_task_alive() {
        let timer = TimerFacility::new();
        let counter = Arc::new(Counter::default());
        let handle = timer.schedule_at_fixed_rate(counter.clone(), Duration::MAX, Duration::MAX);

        tokio::time::sleep(Duration::from_millis(30)).await;
        // A panicked task would have dropped its reference.
        assert_eq!(Arc::strong_count(&counter), 2);
        assert_eq!(counter.ticks(), 0);
        assert_eq!(timer.active(), 1);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn test_first_tick_saturates() {
        let now = Instant::now();
        assert_eq!(first_tick(now, Duration::MAX), now);
        assert_eq!(
            first_tick(now, Duration::from_secs(10)),
            now + Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn test_independent_registrations() {
        let timer = TimerFacility::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let ha =
            timer.schedule_at_fixed_rate(a.clone(), Duration::ZERO, Duration::from_millis(10));
        let hb =
            timer.schedule_at_fixed_rate(b.clone(), Duration::ZERO, Duration::from_millis(10));
        assert_eq!(timer.active(), 2);

        ha.cancel();
        let a_ticks = a.ticks();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(a.ticks() <= a_ticks + 1);
        assert!(b.ticks() >= 2);
        assert_eq!(timer.active(), 1);
        hb.cancel();
    }
}
