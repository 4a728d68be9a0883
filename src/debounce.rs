//! Per-key coalescing timer with a maximum stall bound.
//!
//! Persistence runs are expensive relative to update frequency, so the
//! kernel coalesces them: each call under the same key replaces the pending
//! timer, but the first pending call's start time is preserved so a steady
//! stream of calls cannot postpone the run past `max_interval`. For any key,
//! the work runs no later than `start + max_interval + interval` while calls
//! keep arriving; idle keys never fire. Keys are independent.
//!
//! Runs for one key never overlap: every run (timer, stall, or flush) holds
//! a per-key run lock, and a timer whose pending entry was consumed by a
//! reschedule or a flush wakes up and does nothing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::debug;

struct PendingRun {
    start: Instant,
    /// Identifies which scheduled timer still owns this entry. A timer that
    /// wakes and finds a different id (or no entry) has been superseded.
    run_id: u64,
}

struct DebouncerInner {
    next_run_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingRun>>,
    running: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DebouncerInner {
    fn run_guard(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.running
            .lock()
            .expect("debouncer lock poisoned")
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn drop_run_guard(&self, key: &str, guard: &Arc<AsyncMutex<()>>) {
        let mut running = self.running.lock().expect("debouncer lock poisoned");
        if let Some(existing) = running.get(key) {
            // Two holders means the map and our caller: nobody is waiting.
            if Arc::ptr_eq(existing, guard) && Arc::strong_count(existing) == 2 {
                running.remove(key);
            }
        }
    }

    /// Run `work` while holding the key's run lock, so runs for one key
    /// never overlap.
    async fn run_exclusive<F, Fut>(&self, key: &str, work: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let guard = self.run_guard(key);
        let held = guard.lock().await;
        work().await;
        drop(held);
        self.drop_run_guard(key, &guard);
    }
}

/// Per-key debouncer; timers run on the tokio runtime.
pub struct Debouncer {
    interval: Duration,
    max_interval: Duration,
    inner: Arc<DebouncerInner>,
}

impl Debouncer {
    pub fn new(interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval,
            inner: Arc::new(DebouncerInner {
                next_run_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Schedule `work` to run after the debounce interval, replacing any
    /// pending run for the same key. If calls for this key have already been
    /// stalled for `max_interval`, the work runs right away instead.
    pub fn debounce<F, Fut>(&self, key: &str, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        let mut pending = self.inner.pending.lock().expect("debouncer lock poisoned");

        // Taking the entry supersedes the prior timer; when it fires it
        // finds its id gone and does nothing.
        let start = match pending.remove(key) {
            Some(prior) => prior.start,
            None => now,
        };

        if now.duration_since(start) >= self.max_interval {
            drop(pending);
            debug!(key, "debounce stalled past max interval, running now");
            let inner = Arc::clone(&self.inner);
            let key = key.to_string();
            tokio::spawn(async move {
                inner.run_exclusive(&key, work).await;
            });
            return;
        }

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::SeqCst);
        pending.insert(key.to_string(), PendingRun { start, run_id });
        drop(pending);

        let delay = self.interval;
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let guard = inner.run_guard(&key);
            let held = guard.lock().await;
            // The entry comes out of the map only under the run lock, and
            // only by the timer that still owns it; a reschedule or flush
            // that consumed it first turned this timer into a no-op.
            let owns_entry = {
                let mut pending = inner.pending.lock().expect("debouncer lock poisoned");
                let owns = pending
                    .get(&key)
                    .is_some_and(|entry| entry.run_id == run_id);
                if owns {
                    pending.remove(&key);
                }
                owns
            };
            if owns_entry {
                work().await;
            }
            drop(held);
            inner.drop_run_guard(&key, &guard);
        });
    }

    /// Cancel any pending run for `key` and run `work` immediately,
    /// awaiting its completion. A run already in flight for the key
    /// finishes first; the two never overlap.
    pub async fn flush<F, Fut>(&self, key: &str, work: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.cancel(key);
        self.inner.run_exclusive(key, work).await;
    }

    /// Drop any pending run for `key` without running it.
    pub fn cancel(&self, key: &str) {
        self.inner
            .pending
            .lock()
            .expect("debouncer lock poisoned")
            .remove(key);
    }

    /// Whether a run is currently pending for `key`.
    pub fn is_pending(&self, key: &str) -> bool {
        self.inner
            .pending
            .lock()
            .expect("debouncer lock poisoned")
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_work(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<()> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    /// Work that takes 300ms and records how many runs were in flight at
    /// once, to catch overlapping runs for a key.
    fn tracking_work(
        active: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
        runs: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, ()> {
        let active = Arc::clone(active);
        let peak = Arc::clone(peak);
        let runs = Arc::clone(runs);
        move || {
            let fut: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
                let concurrent = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(concurrent, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            });
            fut
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_calls_within_the_interval() {
        let debouncer = Debouncer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            debouncer.debounce("doc", counter_work(&runs));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending("doc"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_keys_never_fire() {
        let debouncer = Debouncer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let runs = Arc::new(AtomicUsize::new(0));
        debouncer.debounce("doc", counter_work(&runs));
        debouncer.cancel("doc");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_calls_cannot_stall_past_the_max() {
        let debouncer = Debouncer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let runs = Arc::new(AtomicUsize::new(0));

        // Reschedule every 100ms for 1.2s: each call lands inside the
        // debounce window, but the preserved start forces a run at ~1s.
        for _ in 0..12 {
            debouncer.debounce("doc", counter_work(&runs));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The tail call after the forced run still fires on its own timer.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_immediately_and_cancels_the_timer() {
        let debouncer = Debouncer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.debounce("doc", counter_work(&runs));
        debouncer.flush("doc", counter_work(&runs)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The cancelled timer must not fire a second run.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_an_in_flight_run_instead_of_overlapping() {
        let debouncer = Debouncer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.debounce("doc", tracking_work(&active, &peak, &runs));
        // The timer fires at 200ms; by 250ms its work is mid-flight.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // The flush must queue behind the in-flight run, not race it.
        debouncer
            .flush("doc", tracking_work(&active, &peak, &runs))
            .await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_reschedule_during_a_run_does_not_overlap() {
        let debouncer = Debouncer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.debounce("doc", tracking_work(&active, &peak, &runs));
        // The timer fires at 200ms and its work runs until 500ms; this
        // reschedule's own timer fires at 450ms, while the first run is
        // still in flight, and must wait for it.
        tokio::time::sleep(Duration::from_millis(250)).await;
        debouncer.debounce("doc", tracking_work(&active, &peak, &runs));

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let debouncer = Debouncer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        debouncer.debounce("a", counter_work(&a));
        tokio::time::sleep(Duration::from_millis(150)).await;
        debouncer.debounce("b", counter_work(&b));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }
}
