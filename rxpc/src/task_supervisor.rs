use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Internal state for task supervision.
#[derive(Debug)]
struct TaskSupervisorState {
    /// Number of running tasks, plus one while the supervisor accepts work.
    running: AtomicU64,
    accepting: AtomicBool,
    /// Token cancelled when stop is requested.
    stop: CancellationToken,
    /// Token cancelled when all tasks have stopped.
    stopped: CancellationToken,
}

/// Task lifecycle supervisor for graceful shutdown.
///
/// Tracks the handler tasks of a server adapter. After [`stop`](Self::stop)
/// every guard observes [`stopped`](TaskSupervisorGuard::stopped), and
/// [`all_stopped`](Self::all_stopped) resolves once the last guard is gone.
///
/// # Examples
///
/// ```rust,no_run
/// # use rxpc::TaskSupervisor;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::create();
/// let guard = supervisor.start_async_task();
/// tokio::spawn(async move {
///     guard.stopped().await;
///     drop(guard);
/// });
/// supervisor.stop();
/// supervisor.all_stopped().await;
/// # }
/// ```
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// RAII guard for tracking individual async tasks.
///
/// When dropped, decrements the running task count and signals completion if
/// this was the last task after a stop.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisorState {
    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        Self(Arc::new(TaskSupervisorState {
            running: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }))
    }

    /// Requests all tasks to stop. Idempotent.
    pub fn stop(&self) {
        if self.0.accepting.swap(false, Ordering::AcqRel) {
            self.0.stop.cancel();
            self.0.finish_async_task();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Returns a future that completes when stop is requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// Returns a future that completes once stop was requested and every
    /// tracked task has finished.
    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    /// Number of tracked tasks still running.
    #[must_use]
    pub fn running(&self) -> u64 {
        let running = self.0.running.load(Ordering::Acquire);
        running.saturating_sub(u64::from(self.0.accepting.load(Ordering::Acquire)))
    }

    /// Starts tracking a new async task.
    ///
    /// The returned guard must be kept alive for the duration of the task.
    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    /// Returns a future that completes when stop is requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}
