//! Named one-shot timers backed by tokio tasks.
//!
//! Each logical id owns at most one armed timer: scheduling an id that is
//! already armed cancels the previous instance. When a timer fires, its
//! registry entry is taken out *before* the callback runs, so a callback that
//! re-arms its own id (the countdown does this every tick) installs a fresh
//! entry instead of having it removed behind its back.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, warn};

/// Opaque token identifying one arming of a timer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Public view of an armed timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTimer {
    /// Logical name; one active instance per id.
    pub id: String,
    /// When the timer was armed.
    pub armed_at: Instant,
    /// Delay between arming and firing.
    pub delay: Duration,
    /// Cancellation token of this particular arming.
    pub handle: TimerHandle,
}

struct TimerEntry {
    timer: ScheduledTimer,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<String, TimerEntry>>,
    next_handle: AtomicU64,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, TimerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the entry for `id` if it still belongs to `handle`.
    ///
    /// Returns `false` when the timer was cancelled or replaced in the meantime.
    fn take_fired(&self, id: &str, handle: TimerHandle) -> bool {
        let mut entries = self.entries();
        match entries.get(id) {
            Some(entry) if entry.timer.handle == handle => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }
}

/// Cancellable scheduler for delayed callbacks, cheap to clone.
#[derive(Clone, Default)]
pub struct TimerScheduler {
    registry: Arc<Registry>,
}

impl TimerScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `id` to run `callback` after `delay`, replacing any timer already armed under `id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, id: impl Into<String>, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = id.into();
        let handle = TimerHandle(self.registry.next_handle.fetch_add(1, Ordering::Relaxed));
        let registry: Weak<Registry> = Arc::downgrade(&self.registry);

        // The task cannot observe the registry before the entry below is inserted
        // because it needs the same lock to claim its own entry.
        let mut entries = self.registry.entries();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if !registry.take_fired(&task_id, handle) {
                return;
            }
            drop(registry);

            debug!(timer = %task_id, "timer fired");
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                warn!(timer = %task_id, "timer callback panicked");
            }
        });

        let entry = TimerEntry {
            timer: ScheduledTimer {
                id: id.clone(),
                armed_at: Instant::now(),
                delay,
                handle,
            },
            task,
        };
        if let Some(previous) = entries.insert(id.clone(), entry) {
            previous.task.abort();
            debug!(timer = %id, "replaced armed timer");
        }

        handle
    }

    /// Disarm `id`. Returns whether a timer was armed.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.registry.entries().remove(id);
        match removed {
            Some(entry) => {
                entry.task.abort();
                debug!(timer = %id, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Disarm every timer whose id matches `predicate`, returning how many were armed.
    pub fn cancel_where<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&str) -> bool,
    {
        let mut entries = self.registry.entries();
        let ids: Vec<String> = entries
            .keys()
            .filter(|id| predicate(id.as_str()))
            .cloned()
            .collect();
        for id in &ids {
            if let Some(entry) = entries.remove(id) {
                entry.task.abort();
            }
        }
        ids.len()
    }

    /// Disarm every timer.
    pub fn cancel_all(&self) {
        let drained: Vec<TimerEntry> = self.registry.entries().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.task.abort();
        }
    }

    /// Whether a timer is currently armed under `id`.
    pub fn is_armed(&self, id: &str) -> bool {
        self.registry.entries().contains_key(id)
    }

    /// Details of the timer armed under `id`, if any.
    pub fn armed(&self, id: &str) -> Option<ScheduledTimer> {
        self.registry
            .entries()
            .get(id)
            .map(|entry| entry.timer.clone())
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.registry.entries().len()
    }

    /// Whether no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let scheduler = TimerScheduler::new();
        let fired = counter();
        scheduler.schedule("x", Duration::from_millis(500), bump(&fired));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_armed("x"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduling_same_id_replaces_previous_timer() {
        let scheduler = TimerScheduler::new();
        let first = counter();
        let second = counter();

        scheduler.schedule("x", Duration::from_millis(100), bump(&first));
        scheduler.schedule("x", Duration::from_millis(300), bump(&second));
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_callback() {
        let scheduler = TimerScheduler::new();
        let fired = counter();
        scheduler.schedule("x", Duration::from_millis(100), bump(&fired));

        assert!(scheduler.cancel("x"));
        assert!(!scheduler.cancel("x"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    fn chain(scheduler: TimerScheduler, fired: Arc<AtomicUsize>, limit: usize) {
        let next = scheduler.clone();
        scheduler.schedule("x", Duration::from_millis(100), move || {
            let count = fired.fetch_add(1, Ordering::SeqCst) + 1;
            if count < limit {
                chain(next, fired, limit);
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn self_rescheduling_timer_keeps_firing() {
        let scheduler = TimerScheduler::new();
        let fired = counter();
        chain(scheduler.clone(), fired.clone(), 5);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert!(!scheduler.is_armed("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_gone_when_callback_runs() {
        let scheduler = TimerScheduler::new();
        let observed_armed = Arc::new(AtomicBool::new(true));

        let inner = scheduler.clone();
        let observed = observed_armed.clone();
        scheduler.schedule("x", Duration::from_millis(10), move || {
            observed.store(inner.is_armed("x"), Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!observed_armed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_affect_other_timers() {
        let scheduler = TimerScheduler::new();
        let fired = counter();

        scheduler.schedule("boom", Duration::from_millis(10), || panic!("callback failure"));
        scheduler.schedule("ok", Duration::from_millis(20), bump(&fired));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_and_cancel_where() {
        let scheduler = TimerScheduler::new();
        let fired = counter();
        scheduler.schedule("clock-sync:a:1", Duration::from_millis(10), bump(&fired));
        scheduler.schedule("clock-sync:a:2", Duration::from_millis(10), bump(&fired));
        scheduler.schedule("countdown", Duration::from_millis(10), bump(&fired));

        assert_eq!(scheduler.cancel_where(|id| id.starts_with("clock-sync:a:")), 2);
        assert!(scheduler.is_armed("countdown"));

        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_reports_delay() {
        let scheduler = TimerScheduler::new();
        let handle = scheduler.schedule("x", Duration::from_millis(750), || {});
        let armed = scheduler.armed("x").expect("timer armed");
        assert_eq!(armed.delay, Duration::from_millis(750));
        assert_eq!(armed.handle, handle);
        assert_eq!(armed.id, "x");
    }
}
