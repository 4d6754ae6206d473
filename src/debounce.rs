//! Keyed debounce with per-key mutual exclusion.
//!
//! Each key moves Idle → Pending → Executing → Idle. Scheduling overwrites
//! the pending payload and restarts the timer. A timer that fires while the
//! key is still executing is dropped along with its payload.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// Runs a task once after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle>;
}

/// Sleeps on the tokio timer. Must be used from within a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

struct TokioTimer(tokio::task::AbortHandle);

impl TimerHandle for TokioTimer {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle> {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        Box::new(TokioTimer(handle.abort_handle()))
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<(Duration, u64), Task>,
}

/// Virtual clock. Timers run synchronously inside [`ManualScheduler::advance`].
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

struct ManualTimer {
    state: Weak<Mutex<ManualState>>,
    key: (Duration, u64),
}

impl TimerHandle for ManualTimer {
    fn cancel(&self) {
        if let Some(state) = self.state.upgrade() {
            state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .timers
                .remove(&self.key);
        }
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Timers not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.lock().timers.len()
    }

    /// Moves the clock forward, firing due timers in deadline order.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        loop {
            let due = {
                let mut state = self.lock();
                let next = state.timers.keys().next().copied();
                match next {
                    Some(key) if key.0 <= target => {
                        state.now = key.0;
                        state.timers.remove(&key)
                    }
                    _ => None,
                }
            };
            match due {
                Some(task) => task(),
                None => break,
            }
        }
        self.lock().now = target;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle> {
        let mut state = self.lock();
        let key = (state.now + delay, state.next_id);
        state.next_id += 1;
        state.timers.insert(key, task);
        Box::new(ManualTimer {
            state: Arc::downgrade(&self.state),
            key,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    Pending,
    Executing,
}

pub type Callback<K, P> = Arc<dyn Fn(K, P) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<P> {
    payload: Option<P>,
    timer: Option<Box<dyn TimerHandle>>,
    generation: u64,
    /// Generation of the running callback, if any.
    running: Option<u64>,
}

impl<P> Default for Slot<P> {
    fn default() -> Self {
        Self {
            payload: None,
            timer: None,
            generation: 0,
            running: None,
        }
    }
}

struct Slots<K, P> {
    by_key: HashMap<K, Slot<P>>,
    generation: u64,
}

struct Inner<K, P> {
    slots: Mutex<Slots<K, P>>,
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    callback: Callback<K, P>,
}

pub struct DebounceManager<K, P> {
    inner: Arc<Inner<K, P>>,
}

impl<K, P> Clone for DebounceManager<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P> DebounceManager<K, P>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    P: Send + 'static,
{
    pub fn new<F, Fut>(delay: Duration, scheduler: Arc<dyn Scheduler>, callback: F) -> Self
    where
        F: Fn(K, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback<K, P> = Arc::new(move |k, p| Box::pin(callback(k, p)));
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(Slots {
                    by_key: HashMap::new(),
                    generation: 0,
                }),
                scheduler,
                delay,
                callback,
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Replaces the pending payload for `key` and restarts its timer.
    pub fn schedule(&self, key: K, payload: P) {
        self.schedule_in(key, payload, self.inner.delay);
    }

    /// Like [`schedule`](Self::schedule) with an explicit window.
    pub fn schedule_in(&self, key: K, payload: P, delay: Duration) {
        let mut slots = self.inner.lock();
        slots.generation += 1;
        let generation = slots.generation;
        let slot = slots.by_key.entry(key.clone()).or_default();
        if let Some(timer) = slot.timer.take() {
            timer.cancel();
        }
        slot.payload = Some(payload);
        slot.generation = generation;

        let weak = Arc::downgrade(&self.inner);
        let fire_key = key;
        slot.timer = Some(self.inner.scheduler.schedule_after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Inner::fire(&inner, fire_key, generation);
                }
            }),
        ));
    }

    /// Cancels every timer and forgets payloads and executing flags. A
    /// running callback is not interrupted.
    pub fn clear(&self) {
        let mut slots = self.inner.lock();
        for (_, slot) in slots.by_key.drain() {
            if let Some(timer) = slot.timer {
                timer.cancel();
            }
        }
    }

    pub fn state(&self, key: &K) -> KeyState {
        let slots = self.inner.lock();
        match slots.by_key.get(key) {
            Some(slot) if slot.running.is_some() => KeyState::Executing,
            Some(slot) if slot.payload.is_some() || slot.timer.is_some() => KeyState::Pending,
            _ => KeyState::Idle,
        }
    }

    /// Keys with a pending timer or a running callback.
    pub fn active(&self) -> usize {
        self.inner.lock().by_key.len()
    }
}

impl<K, P> Inner<K, P>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    P: Send + 'static,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, Slots<K, P>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire(inner: &Arc<Self>, key: K, generation: u64) {
        let payload = {
            let mut slots = inner.lock();
            let Some(slot) = slots.by_key.get_mut(&key) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.timer = None;
            if slot.running.is_some() {
                slot.payload = None;
                debug!(key = ?key, "previous run still executing; update dropped");
                return;
            }
            let Some(payload) = slot.payload.take() else {
                return;
            };
            slot.running = Some(generation);
            payload
        };

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            // A panicking callback must still release the key.
            let run = AssertUnwindSafe(async { (inner.callback)(key.clone(), payload).await });
            if run.catch_unwind().await.is_err() {
                warn!(key = ?key, "reaction panicked");
            }
            inner.finish(&key, generation);
        });
    }

    fn finish(&self, key: &K, generation: u64) {
        let mut slots = self.lock();
        let Some(slot) = slots.by_key.get_mut(key) else {
            return;
        };
        // After clear() the slot may belong to a newer run.
        if slot.running != Some(generation) {
            return;
        }
        slot.running = None;
        if slot.payload.is_none() && slot.timer.is_none() {
            slots.by_key.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{Semaphore, mpsc};

    use super::*;

    const DELAY: Duration = Duration::from_millis(1000);

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn manual_scheduler_fires_in_deadline_order() {
        let sched = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (delay, name) in [(30, "c"), (10, "a"), (20, "b")] {
            let log = Arc::clone(&log);
            sched.schedule_after(
                Duration::from_millis(delay),
                Box::new(move || log.lock().unwrap().push(name)),
            );
        }
        let cancelled = {
            let log = Arc::clone(&log);
            sched.schedule_after(
                Duration::from_millis(15),
                Box::new(move || log.lock().unwrap().push("x")),
            )
        };
        cancelled.cancel();

        sched.advance(Duration::from_millis(20));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        sched.advance(Duration::from_millis(20));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(sched.now(), Duration::from_millis(40));
        assert_eq!(sched.pending(), 0);
    }

    #[tokio::test]
    async fn burst_runs_once_with_latest_payload() {
        let sched = ManualScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mgr = DebounceManager::new(DELAY, Arc::new(sched.clone()), move |k: &'static str, p: u32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((k, p));
            }
        });

        mgr.schedule("a", 1);
        sched.advance(Duration::from_millis(400));
        mgr.schedule("a", 2);
        mgr.schedule("a", 3);
        sched.advance(Duration::from_millis(999));
        assert_eq!(mgr.state(&"a"), KeyState::Pending);

        sched.advance(Duration::from_millis(1));
        assert_eq!(rx.recv().await, Some(("a", 3)));
        settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(mgr.state(&"a"), KeyState::Idle);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let sched = ManualScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mgr = DebounceManager::new(DELAY, Arc::new(sched.clone()), move |k: &'static str, p: u32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((k, p));
            }
        });
        mgr.schedule("a", 1);
        mgr.schedule("b", 2);
        sched.advance(DELAY);
        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![("a", 1), ("b", 2)]);
    }

    #[tokio::test]
    async fn panicking_callback_releases_the_key() {
        let sched = ManualScheduler::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mgr = {
            let seen = seen.clone();
            DebounceManager::new(DELAY, Arc::new(sched.clone()), move |_k: u8, p: u32| {
                let seen = seen.clone();
                async move {
                    if p == 1 {
                        panic!("callback failed");
                    }
                    seen.lock().unwrap().push(p);
                }
            })
        };

        mgr.schedule(1, 1);
        sched.advance(DELAY);
        settle().await;
        assert_eq!(mgr.state(&1), KeyState::Idle);

        mgr.schedule(1, 2);
        sched.advance(DELAY);
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![2]);
        assert_eq!(mgr.state(&1), KeyState::Idle);
    }

    #[tokio::test]
    async fn fire_while_executing_is_dropped() {
        let sched = ManualScheduler::new();
        let gate = Arc::new(Semaphore::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mgr = {
            let (gate, running, max_running, seen) =
                (gate.clone(), running.clone(), max_running.clone(), seen.clone());
            DebounceManager::new(DELAY, Arc::new(sched.clone()), move |_k: u8, p: u32| {
                let (gate, running, max_running, seen) =
                    (gate.clone(), running.clone(), max_running.clone(), seen.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    seen.lock().unwrap().push(p);
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            })
        };

        mgr.schedule(1, 10);
        sched.advance(DELAY);
        settle().await;
        assert_eq!(mgr.state(&1), KeyState::Executing);

        mgr.schedule(1, 20);
        sched.advance(DELAY);
        settle().await;
        assert_eq!(mgr.state(&1), KeyState::Executing);

        gate.add_permits(1);
        settle().await;
        assert_eq!(mgr.state(&1), KeyState::Idle);
        assert_eq!(*seen.lock().unwrap(), vec![10]);
        assert_eq!(max_running.load(Ordering::SeqCst), 1);

        mgr.schedule(1, 30);
        sched.advance(DELAY);
        gate.add_permits(1);
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![10, 30]);
    }

    #[tokio::test]
    async fn explicit_window_overrides_default() {
        let sched = ManualScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mgr = DebounceManager::new(DELAY, Arc::new(sched.clone()), move |k: &'static str, p: u32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((k, p));
            }
        });
        mgr.schedule_in("a", 1, Duration::from_millis(500));
        sched.advance(Duration::from_millis(500));
        assert_eq!(rx.recv().await, Some(("a", 1)));
    }

    #[tokio::test]
    async fn clear_cancels_pending_timers() {
        let sched = ManualScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mgr = DebounceManager::new(DELAY, Arc::new(sched.clone()), move |k: &'static str, p: u32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((k, p));
            }
        });
        mgr.schedule("a", 1);
        mgr.schedule("b", 1);
        mgr.clear();
        assert_eq!(sched.pending(), 0);
        assert_eq!(mgr.active(), 0);
        sched.advance(DELAY * 2);
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_debounces() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mgr = DebounceManager::new(
            Duration::from_millis(500),
            Arc::new(TokioScheduler),
            move |k: &'static str, p: u32| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((k, p));
                }
            },
        );
        mgr.schedule("a", 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        mgr.schedule("a", 2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.recv().await, Some(("a", 2)));
        assert!(rx.try_recv().is_err());
    }
}
