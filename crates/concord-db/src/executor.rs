//! Bounded background execution for store work.
//!
//! Every piece of store I/O that runs off the caller's path (fire-and-forget
//! saves, periodic sync jobs) goes through one [`BackgroundExecutor`]. It
//! enforces two limits independent of pool sizing:
//!
//! - at most `max_concurrent_tasks` tasks touch the store at once
//! - no task runs longer than `task_timeout`; an overrunning task is
//!   abandoned with [`DbError::Timeout`] and left for the next periodic run
//!
//! The executor also counts in-flight tasks so shutdown can wait for them
//! for a bounded grace period before the pool is closed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::error::DbError;

/// Default number of background tasks allowed to touch the store at once.
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 8;

/// Default bound on a single background task.
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;

/// Limits applied to background store work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of background tasks running store I/O in parallel.
    pub max_concurrent_tasks: usize,
    /// Maximum wall-clock time for one background task.
    pub task_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
        }
    }
}

struct ExecutorInner {
    permits: Semaphore,
    task_timeout: Duration,
    in_flight: AtomicUsize,
    idle: Notify,
    runtime: Option<Handle>,
}

/// Shared limiter and tracker for background store tasks.
///
/// Cheap to clone; all clones share the same permits and counters.
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<ExecutorInner>,
}

impl BackgroundExecutor {
    /// Create an executor.
    ///
    /// If called inside a Tokio runtime the runtime handle is captured, so
    /// [`spawn`](Self::spawn) also works later from threads that are not
    /// part of the runtime (the game tick thread).
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                permits: Semaphore::new(config.max_concurrent_tasks.max(1)),
                task_timeout: config.task_timeout,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// The per-task time bound.
    pub fn task_timeout(&self) -> Duration {
        self.inner.task_timeout
    }

    /// Number of tasks currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// The runtime handle captured at construction, if any.
    pub fn runtime(&self) -> Option<&Handle> {
        self.inner.runtime.as_ref()
    }

    /// Run `fut` on the current task under a permit and the task timeout.
    pub async fn run<T, F>(&self, name: &'static str, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        let _guard = InFlight::enter(&self.inner);
        self.run_limited(name, fut).await
    }

    /// Spawn `fut` in the background and return a completion handle.
    ///
    /// The handle may be awaited with [`Pending::wait`] or dropped; a
    /// dropped handle does not cancel the task.
    pub fn spawn<T, F>(&self, name: &'static str, fut: F) -> Pending<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, DbError>> + Send + 'static,
    {
        let handle = match self.inner.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle,
            None => {
                tracing::warn!(task = name, "no async runtime available for background task");
                return Pending::ready(Err(DbError::Unavailable(
                    "no async runtime available".to_owned(),
                )));
            }
        };

        let guard = InFlight::enter(&self.inner);
        let this = self.clone();
        let join = handle.spawn(async move {
            let _guard = guard;
            this.run_limited(name, fut).await
        });
        Pending::spawned(join)
    }

    /// Stop handing out permits. Tasks waiting for one fail as unavailable.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    /// Wait until no task is in flight, or until `grace` elapses.
    ///
    /// Returns `true` if the executor drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait_idle = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait_idle).await.is_ok()
    }

    async fn run_limited<T, F>(&self, name: &'static str, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|e| DbError::Unavailable(format!("background executor closed: {e}")))?;

        if let Ok(result) = tokio::time::timeout(self.inner.task_timeout, fut).await {
            result
        } else {
            tracing::warn!(
                task = name,
                timeout_secs = self.inner.task_timeout.as_secs(),
                "background task exceeded its time bound, abandoned"
            );
            Err(DbError::Timeout(format!(
                "task {name} exceeded {}s",
                self.inner.task_timeout.as_secs()
            )))
        }
    }
}

impl std::fmt::Debug for BackgroundExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundExecutor")
            .field("available_permits", &self.inner.permits.available_permits())
            .field("in_flight", &self.in_flight())
            .field("task_timeout", &self.inner.task_timeout)
            .finish()
    }
}

/// Counts one in-flight task for as long as it lives.
struct InFlight {
    inner: Arc<ExecutorInner>,
}

impl InFlight {
    fn enter(inner: &Arc<ExecutorInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Completion handle for a background store operation.
#[derive(Debug)]
pub struct Pending<T> {
    state: PendingState<T>,
}

#[derive(Debug)]
enum PendingState<T> {
    Spawned(JoinHandle<Result<T, DbError>>),
    Ready(Result<T, DbError>),
}

impl<T> Pending<T> {
    const fn spawned(join: JoinHandle<Result<T, DbError>>) -> Self {
        Self {
            state: PendingState::Spawned(join),
        }
    }

    /// A handle that is already complete.
    pub const fn ready(result: Result<T, DbError>) -> Self {
        Self {
            state: PendingState::Ready(result),
        }
    }

    /// Whether the operation has finished.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            PendingState::Spawned(join) => join.is_finished(),
            PendingState::Ready(_) => true,
        }
    }

    /// Wait for the operation and return its result.
    pub async fn wait(self) -> Result<T, DbError> {
        match self.state {
            PendingState::Spawned(join) => match join.await {
                Ok(result) => result,
                Err(e) => Err(DbError::TaskFailed(e.to_string())),
            },
            PendingState::Ready(result) => result,
        }
    }
}
