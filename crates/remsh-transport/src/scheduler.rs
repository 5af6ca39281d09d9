//! One-shot timeouts with explicit cancellation.
//!
//! Fired tasks run on a bounded pool: each needs a semaphore permit before it
//! starts, so a burst of expiring timers cannot monopolize the runtime. A
//! background task periodically drops fired and cancelled entries from the
//! registry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::attributes::AttributeKey;
use crate::session::{lock, Session};

/// Session attribute holding the handshake or login timeout of that session.
pub const TIMEOUT_KEY: AttributeKey =
    AttributeKey::new("remsh_transport::scheduler::TimeoutScheduler", "timeout");

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of fired tasks running at once.
    pub workers: usize,
    /// How often fired and cancelled entries are dropped from the registry.
    pub purge_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            purge_interval_ms: 60_000,
        }
    }
}

struct TimeoutEntry {
    id: u64,
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one scheduled timeout.
#[derive(Clone)]
pub struct TimeoutHandle {
    entry: Arc<TimeoutEntry>,
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("id", &self.entry.id)
            .field("state", &self.entry.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl TimeoutHandle {
    fn new(id: u64) -> Self {
        Self {
            entry: Arc::new(TimeoutEntry {
                id,
                state: AtomicU8::new(PENDING),
                task: Mutex::new(None),
            }),
        }
    }

    /// Scheduler-assigned id.
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// Cancels the timeout. Returns `true` only if it had neither fired nor
    /// been cancelled before.
    pub fn cancel(&self) -> bool {
        if self
            .entry
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(task) = lock(&self.entry.task).take() {
            task.abort();
        }
        true
    }

    /// Neither fired nor cancelled.
    pub fn is_pending(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == PENDING
    }

    /// The task has started.
    pub fn is_fired(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == FIRED
    }

    /// Cancelled before firing.
    pub fn is_cancelled(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == CANCELLED
    }

    fn fire(&self) -> bool {
        self.entry
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Runs one-shot tasks after a delay.
pub struct TimeoutScheduler {
    entries: DashMap<u64, TimeoutHandle>,
    workers: Arc<Semaphore>,
    next_id: AtomicU64,
    purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("entries", &self.entries.len())
            .field("idle_workers", &self.workers.available_permits())
            .finish()
    }
}

impl TimeoutScheduler {
    /// Creates the scheduler and starts its purge task. Must be called from
    /// within a tokio runtime.
    pub fn start(config: SchedulerConfig) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            entries: DashMap::new(),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            next_id: AtomicU64::new(1),
            purge_task: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&scheduler);
        let period = Duration::from_millis(config.purge_interval_ms.max(1));
        let purge = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(scheduler) => scheduler.purge(),
                    None => break,
                }
            }
        });
        *lock(&scheduler.purge_task) = Some(purge);
        scheduler
    }

    /// Runs `task` after `delay` unless the returned handle is cancelled first.
    pub fn schedule<F, Fut>(&self, delay: Duration, task: F) -> TimeoutHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.create();
        self.arm(&handle, delay, task);
        handle
    }

    /// Schedules `task` as the single session timeout of `session`.
    ///
    /// The handle is bound under [`TIMEOUT_KEY`], cancelling any timeout it
    /// replaces. When it fires, the task first unbinds its own handle.
    pub fn schedule_for<F, Fut>(&self, session: &Session, delay: Duration, task: F) -> TimeoutHandle
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.create();
        let id = handle.id();
        if let Some(previous) = session.attributes().rebind(TIMEOUT_KEY, handle.clone()) {
            if let Some(previous) = previous.downcast_ref::<TimeoutHandle>() {
                previous.cancel();
            }
        }

        let weak = session.downgrade();
        self.arm(&handle, delay, move || async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            session
                .attributes()
                .unbind_if::<TimeoutHandle, _>(TIMEOUT_KEY, |bound| bound.id() == id);
            task(session).await;
        });
        handle
    }

    /// Unbinds and cancels the session timeout of `session`.
    ///
    /// Returns `false` if none was bound or it had already fired.
    pub fn cancel_for(&self, session: &Session) -> bool {
        match session.attributes().unbind_as::<TimeoutHandle>(TIMEOUT_KEY) {
            Ok(Some(handle)) => handle.cancel(),
            _ => false,
        }
    }

    /// Drops fired and cancelled entries from the registry.
    pub fn purge(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, handle| handle.is_pending());
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            trace!(purged, "purged completed timeouts");
        }
    }

    /// Number of entries currently in the registry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn create(&self) -> TimeoutHandle {
        let handle = TimeoutHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(handle.id(), handle.clone());
        handle
    }

    fn arm<F, Fut>(&self, handle: &TimeoutHandle, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fired = handle.clone();
        let workers = Arc::clone(&self.workers);
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !fired.fire() {
                return;
            }
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            debug!(timeout = fired.id(), "timeout fired");
            task().await;
        });
        let mut slot = lock(&handle.entry.task);
        if handle.is_cancelled() {
            join.abort();
        } else {
            *slot = Some(join);
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        if let Some(purge) = lock(&self.purge_task).take() {
            purge.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::session;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        (count, move || Arc::clone(&shared))
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_fires_after_delay() {
        let scheduler = TimeoutScheduler::start(SchedulerConfig::default());
        let (count, clone) = counter();
        let hits = clone();
        let handle = scheduler.schedule(Duration::from_millis(100), move || async move {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_pending());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_fired());
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let scheduler = TimeoutScheduler::start(SchedulerConfig::default());
        let (count, clone) = counter();
        let hits = clone();
        let handle = scheduler.schedule(Duration::from_millis(100), move || async move {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.cancel());
        assert!(!handle.cancel());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_completed_entries() {
        let scheduler = TimeoutScheduler::start(SchedulerConfig::default());
        let fired = scheduler.schedule(Duration::from_millis(10), || async {});
        let cancelled = scheduler.schedule(Duration::from_millis(10), || async {});
        let _pending = scheduler.schedule(Duration::from_secs(3600), || async {});
        cancelled.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.is_fired());

        assert_eq!(scheduler.len(), 3);
        scheduler.purge();
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_purge_runs() {
        let scheduler = TimeoutScheduler::start(SchedulerConfig {
            workers: 2,
            purge_interval_ms: 1_000,
        });
        let handle = scheduler.schedule(Duration::from_millis(10), || async {});
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_for_binds_and_unbinds() {
        let scheduler = TimeoutScheduler::start(SchedulerConfig::default());
        let (session, _rx) = session();
        let (count, clone) = counter();
        let hits = clone();
        scheduler.schedule_for(&session, Duration::from_millis(100), move |_| async move {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert!(session.attributes().contains(TIMEOUT_KEY));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!session.attributes().contains(TIMEOUT_KEY));
        assert!(!scheduler.cancel_for(&session));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_for_replaces_previous() {
        let scheduler = TimeoutScheduler::start(SchedulerConfig::default());
        let (session, _rx) = session();
        let first = scheduler.schedule_for(&session, Duration::from_millis(100), |_| async {});
        let second = scheduler.schedule_for(&session, Duration::from_millis(100), |_| async {});
        assert!(first.is_cancelled());
        assert!(second.is_pending());

        assert!(scheduler.cancel_for(&session));
        assert!(second.is_cancelled());
        assert!(!scheduler.cancel_for(&session));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let scheduler = TimeoutScheduler::start(SchedulerConfig {
            workers: 1,
            purge_interval_ms: 60_000,
        });
        let (running, _) = counter();
        let (peak, _) = counter();
        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            scheduler.schedule(Duration::from_millis(10), move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
