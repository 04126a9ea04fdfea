use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// key: billing-retry-state -> doubling delay with cap
///
/// One instance per operation family. The delay doubles on every retryable
/// failure and returns to base on success or once the cap has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryState {
    delay: Duration,
    base: Duration,
    cap: Duration,
}

/// Result of asking a [`RetryState`] for the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    RetryAfter(Duration),
    Exhausted,
}

impl RetryState {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            delay: base,
            base,
            cap,
        }
    }

    pub fn from_millis(base_ms: u64, cap_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    pub fn reset(&mut self) {
        self.delay = self.base;
    }

    /// Consumes one retryable failure.
    pub fn next_step(&mut self) -> RetryStep {
        if self.delay < self.cap {
            let wait = self.delay;
            self.delay = self.delay.saturating_mul(2).min(self.cap);
            RetryStep::RetryAfter(wait)
        } else {
            self.reset();
            RetryStep::Exhausted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled(Duration),
    /// A retry for the same key is already pending; nothing new was scheduled.
    AlreadyPending,
    Exhausted,
}

/// key: billing-backoff-scheduler -> delayed re-invocation timers
///
/// Holds at most one pending timer per key. The timer runs the supplied
/// future after the delay; the owner calls [`BackoffScheduler::complete`]
/// when the fired retry is handled.
#[derive(Debug)]
pub struct BackoffScheduler<K> {
    pending: HashMap<K, JoinHandle<()>>,
}

impl<K> Default for BackoffScheduler<K> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<K> BackoffScheduler<K>
where
    K: Eq + Hash + Copy + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, key: K) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn pending_keys(&self) -> Vec<K> {
        self.pending.keys().copied().collect()
    }

    /// Records a retryable failure for `key` and schedules `fire` after the
    /// current delay, unless a retry is already pending or the cap was reached.
    pub fn schedule<F>(&mut self, key: K, state: &mut RetryState, fire: F) -> ScheduleOutcome
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_pending(key) {
            debug!(?key, "retry already pending; dropping duplicate request");
            return ScheduleOutcome::AlreadyPending;
        }
        match state.next_step() {
            RetryStep::RetryAfter(wait) => {
                debug!(?key, delay_ms = wait.as_millis() as u64, "scheduling retry");
                let handle = tokio::spawn(async move {
                    sleep(wait).await;
                    fire.await;
                });
                self.pending.insert(key, handle);
                ScheduleOutcome::Scheduled(wait)
            }
            RetryStep::Exhausted => ScheduleOutcome::Exhausted,
        }
    }

    /// Marks the pending retry for `key` as delivered.
    pub fn complete(&mut self, key: K) -> bool {
        self.pending.remove(&key).is_some()
    }

    pub fn cancel(&mut self, key: K) -> bool {
        match self.pending.remove(&key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.pending.len();
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
        cancelled
    }
}

impl<K> Drop for BackoffScheduler<K> {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delays_double_until_cap_then_reset() {
        let mut state = RetryState::from_millis(1_000, 300_000);
        let mut observed = Vec::new();
        while let RetryStep::RetryAfter(wait) = state.next_step() {
            observed.push(wait.as_millis() as u64);
        }
        assert_eq!(
            observed,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000]
        );
        assert_eq!(state.delay(), Duration::from_millis(1_000));
        assert_eq!(state.next_step(), RetryStep::RetryAfter(Duration::from_millis(1_000)));
    }

    #[test]
    fn consume_cap_gives_up_sooner() {
        let mut state = RetryState::from_millis(1_000, 120_000);
        let mut retries = 0;
        while let RetryStep::RetryAfter(_) = state.next_step() {
            retries += 1;
        }
        assert_eq!(retries, 7);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut state = RetryState::from_millis(500, 8_000);
        state.next_step();
        state.next_step();
        assert_eq!(state.delay(), Duration::from_millis(2_000));
        state.reset();
        assert_eq!(state.delay(), state.base());
    }

    #[tokio::test(start_paused = true)]
    async fn drops_duplicate_while_pending() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = BackoffScheduler::new();
        let mut state = RetryState::from_millis(1_000, 300_000);

        let counter = fired.clone();
        let first = scheduler.schedule("query", &mut state, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = fired.clone();
        let second = scheduler.schedule("query", &mut state, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(first, ScheduleOutcome::Scheduled(Duration::from_millis(1_000)));
        assert_eq!(second, ScheduleOutcome::AlreadyPending);
        assert_eq!(state.delay(), Duration::from_millis(2_000));

        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.complete("query"));
        assert!(!scheduler.is_pending("query"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scheduler = BackoffScheduler::new();
        let mut state = RetryState::from_millis(1_000, 300_000);
        let counter = fired.clone();
        scheduler.schedule("consume", &mut state, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(scheduler.cancel_all(), 1);
        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
