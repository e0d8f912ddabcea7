//! Bounded, per-key serialized admission of ingestion work.
//!
//! [`AdmissionController`] runs opaque units of work on a fixed number of
//! worker permits. Work is submitted under a key; at most one unit per key is
//! ever running, and units sharing a key run strictly in submission order.
//!
//! Each in-flight key owns a single runner task that holds the key's FIFO
//! queue. The runner takes a worker permit per unit, so distinct keys compete
//! for the pool while same-key units never overlap. A second semaphore caps
//! queued-plus-running units and holds the producer back when full.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Sizing for an [`AdmissionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Maximum units running at once across all keys.
    pub pool_size: usize,
    /// Maximum units queued or running before `submit` waits.
    pub queue_capacity: usize,
}

/// Where a key currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Nothing queued or running; the last unit (if any) succeeded.
    Idle,
    /// Work is waiting for a worker permit.
    Queued,
    /// A unit for this key is executing.
    Running,
    /// Nothing queued or running; the last unit failed.
    Failed,
}

/// Submission refused by the controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Admission rejected: controller is draining")]
    Rejected,
}

/// Why a submitted unit of work did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task abandoned before completion")]
    Abandoned,
}

/// Completion handle for one submitted unit of work.
#[derive(Debug)]
pub struct Ticket<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> Ticket<T> {
    /// Wait for the unit to finish.
    ///
    /// Resolves to [`TaskError::Abandoned`] if the unit was dropped by a
    /// drain timeout before it could report.
    pub async fn outcome(self) -> Result<T, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Abandoned))
    }
}

/// Result of [`AdmissionController::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport<K> {
    /// Keys that still had queued or running work when the timeout expired.
    pub unresolved: Vec<K>,
}

impl<K> DrainReport<K> {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// A queued unit. The slot permit is released when the unit is dropped.
struct QueuedUnit {
    job: BoxFuture<'static, bool>,
    _slot: OwnedSemaphorePermit,
}

struct KeyEntry {
    queue: VecDeque<QueuedUnit>,
    running: bool,
    runner: Option<AbortHandle>,
}

struct State<K> {
    keys: HashMap<K, KeyEntry>,
    failed: HashSet<K>,
    closed: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    workers: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    running: AtomicUsize,
    idle: Notify,
    config: AdmissionConfig,
}

impl<K> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrements the live gauge even when the runner is aborted mid-unit.
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Bounded worker pool with per-key serialization.
pub struct AdmissionController<K> {
    shared: Arc<Shared<K>>,
}

impl<K> fmt::Debug for AdmissionController<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.shared.config)
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<K> AdmissionController<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Create a controller. Zero sizes are raised to one.
    pub fn new(config: AdmissionConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        let queue_capacity = config.queue_capacity.max(pool_size);
        let config = AdmissionConfig {
            pool_size,
            queue_capacity,
        };

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    keys: HashMap::new(),
                    failed: HashSet::new(),
                    closed: false,
                }),
                workers: Arc::new(Semaphore::new(pool_size)),
                slots: Arc::new(Semaphore::new(queue_capacity)),
                running: AtomicUsize::new(0),
                idle: Notify::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> AdmissionConfig {
        self.shared.config
    }

    /// Units executing right now.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Units queued or running.
    pub fn outstanding(&self) -> usize {
        self.shared.config.queue_capacity - self.shared.slots.available_permits()
    }

    pub fn is_draining(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn key_state(&self, key: &K) -> KeyState {
        let state = self.shared.lock();
        match state.keys.get(key) {
            Some(entry) if entry.running => KeyState::Running,
            Some(_) => KeyState::Queued,
            None if state.failed.contains(key) => KeyState::Failed,
            None => KeyState::Idle,
        }
    }

    /// Submit a unit of work under `key`.
    ///
    /// Waits while the queue is full. The returned [`Ticket`] resolves when
    /// the unit finishes; an `Err` from the unit becomes
    /// [`TaskError::Failed`] and a panic becomes [`TaskError::Panicked`].
    pub async fn submit<F, T, E>(&self, key: K, work: F) -> Result<Ticket<T>, AdmissionError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if self.is_draining() {
            return Err(AdmissionError::Rejected);
        }

        let slot = Arc::clone(&self.shared.slots)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Rejected)?;

        let (tx, rx) = oneshot::channel();
        let job = async move {
            let (outcome, ok) = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(value)) => (Ok(value), true),
                Ok(Err(e)) => (Err(TaskError::Failed(e.to_string())), false),
                Err(payload) => (Err(TaskError::Panicked(panic_message(payload.as_ref()))), false),
            };
            let _ = tx.send(outcome);
            ok
        }
        .boxed();

        let unit = QueuedUnit { job, _slot: slot };

        let mut state = self.shared.lock();
        if state.closed {
            return Err(AdmissionError::Rejected);
        }
        state.failed.remove(&key);

        if let Some(entry) = state.keys.get_mut(&key) {
            entry.queue.push_back(unit);
            tracing::debug!(key = ?key, queued = entry.queue.len(), "Queued behind in-flight key");
        } else {
            let mut entry = KeyEntry {
                queue: VecDeque::from([unit]),
                running: false,
                runner: None,
            };
            let handle = tokio::spawn(run_key(Arc::clone(&self.shared), key.clone()));
            entry.runner = Some(handle.abort_handle());
            state.keys.insert(key, entry);
        }

        Ok(Ticket { rx })
    }

    /// Stop admitting work and wait up to `timeout` for outstanding units.
    ///
    /// Keys whose work is still queued or running at the deadline are
    /// aborted and listed in the report; their tickets resolve to
    /// [`TaskError::Abandoned`].
    pub async fn drain(&self, timeout: Duration) -> DrainReport<K> {
        self.shared.lock().closed = true;
        self.shared.slots.close();
        tracing::info!(
            outstanding = self.outstanding(),
            timeout = ?timeout,
            "Draining admission controller",
        );

        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            tracing::info!("Admission controller drained");
            return DrainReport {
                unresolved: Vec::new(),
            };
        }

        let abandoned: Vec<(K, KeyEntry)> = self.shared.lock().keys.drain().collect();
        let mut unresolved = Vec::with_capacity(abandoned.len());
        for (key, entry) in abandoned {
            if let Some(runner) = &entry.runner {
                runner.abort();
            }
            tracing::warn!(
                key = ?key,
                running = entry.running,
                queued = entry.queue.len(),
                "Abandoning unfinished work at drain timeout",
            );
            unresolved.push(key);
        }
        self.shared.idle.notify_waiters();

        DrainReport { unresolved }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.lock().keys.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-key runner: executes the key's queue front to back, one unit at a time.
async fn run_key<K>(shared: Arc<Shared<K>>, key: K)
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    loop {
        let Ok(_permit) = Arc::clone(&shared.workers).acquire_owned().await else {
            return;
        };

        let unit = {
            let mut state = shared.lock();
            let Some(entry) = state.keys.get_mut(&key) else {
                return;
            };
            match entry.queue.pop_front() {
                Some(unit) => {
                    entry.running = true;
                    unit
                }
                None => {
                    state.keys.remove(&key);
                    if state.keys.is_empty() {
                        shared.idle.notify_waiters();
                    }
                    return;
                }
            }
        };

        let ok = {
            let _gauge = RunningGuard::enter(&shared.running);
            let QueuedUnit { job, _slot } = unit;
            job.await
        };

        if finish_unit(&shared, &key, ok) {
            return;
        }
    }
}

/// Record a finished unit. Returns `true` when the key has nothing left.
fn finish_unit<K>(shared: &Shared<K>, key: &K, ok: bool) -> bool
where
    K: Eq + Hash + Clone,
{
    let mut state = shared.lock();
    if ok {
        state.failed.remove(key);
    } else {
        state.failed.insert(key.clone());
    }

    let Some(entry) = state.keys.get_mut(key) else {
        return true;
    };
    entry.running = false;
    if !entry.queue.is_empty() {
        return false;
    }

    state.keys.remove(key);
    if state.keys.is_empty() {
        shared.idle.notify_waiters();
    }
    true
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into())
}
