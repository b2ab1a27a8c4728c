//! Periodic background jobs with cooperative shutdown.
//!
//! Each job runs on its own task. Every run acquires a permit from the
//! shared [`BackgroundExecutor`] and is bounded by its task timeout; a run
//! that fails or times out is logged and the loop waits for the next tick.
//! Shutdown is checked between runs, never inside one.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use concord_db::{BackgroundExecutor, DbError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::CoreError;

/// Owns the periodic job tasks of one service.
pub struct Scheduler {
    executor: BackgroundExecutor,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    /// Create a scheduler running jobs on `executor`.
    pub fn new(executor: BackgroundExecutor) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `job` every `interval`, starting immediately.
    ///
    /// Ticks missed while a run was in progress are skipped, not replayed.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let executor = self.executor.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(job = name, interval_ms = period.as_millis(), "Periodic job started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                match executor.run(name, async { Ok::<_, DbError>(job().await) }).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(job = name, error = %e, "Periodic job failed"),
                    Err(DbError::Unavailable(reason)) => {
                        tracing::debug!(job = name, reason = %reason, "Executor closed, stopping job");
                        break;
                    }
                    Err(e) => tracing::warn!(job = name, error = %e, "Periodic job abandoned"),
                }
            }
            tracing::debug!(job = name, "Periodic job stopped");
        });

        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((name, handle));
    }

    /// Number of jobs spawned so far.
    pub fn job_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Signal every job to stop after its current run.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Signal shutdown and wait up to `grace` for the job tasks to exit.
    ///
    /// Tasks still running after the grace period are aborted. Returns
    /// `true` if every task exited on its own.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.signal_shutdown();
        let mut tasks: Vec<_> = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        let drained = tokio::time::timeout(
            grace,
            futures::future::join_all(tasks.iter_mut().map(|(_, handle)| handle)),
        )
        .await
        .is_ok();

        if !drained {
            for (name, handle) in &tasks {
                if !handle.is_finished() {
                    tracing::warn!(job = name, "Periodic job did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        drained
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.job_count())
            .field("shutdown", &*self.shutdown.borrow())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use concord_db::ExecutorConfig;
    use concord_types::MessageKind;

    use super::*;

    fn scheduler(timeout: Duration) -> Scheduler {
        Scheduler::new(BackgroundExecutor::new(&ExecutorConfig {
            max_concurrent_tasks: 2,
            task_timeout: timeout,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_each_interval_until_shutdown() {
        let sched = scheduler(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        sched.spawn_periodic("count", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(sched.shutdown(Duration::from_secs(1)).await);
        let after_shutdown = runs.load(Ordering::SeqCst);
        assert!(after_shutdown >= 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_slow_runs_do_not_stop_the_loop() {
        let sched = scheduler(Duration::from_secs(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        sched.spawn_periodic("flaky", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err(CoreError::handler(MessageKind::ServerNotice, "boom")),
                    1 => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert!(sched.shutdown(Duration::from_secs(1)).await);
    }
}
