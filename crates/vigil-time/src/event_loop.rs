//! Event loop - tokio-backed serial execution context

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use vigil_core::{Executor, ExecutorRef, Job, TimerHandle, TimerService};

struct LoopInner {
    /// Serial job queue drained by the loop task
    tx: mpsc::UnboundedSender<Job>,
    /// Runtime timers are spawned on
    runtime: Handle,
    /// The loop task itself
    task: AbortHandle,
}

/// Serial execution context running on a tokio runtime
///
/// Jobs run one at a time, in submission order, on a single task.
/// Timers sleep on `tokio::time` and post their job to the same queue.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Spawn a loop on the current tokio runtime
    ///
    /// Panics outside a runtime, like `tokio::spawn`.
    pub fn spawn() -> Self {
        Self::spawn_on(&Handle::current())
    }

    /// Spawn a loop on the given runtime
    pub fn spawn_on(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let task = runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("event loop job panicked");
                }
            }
            tracing::debug!("event loop stopped");
        });

        EventLoop {
            inner: Arc::new(LoopInner {
                tx,
                runtime: runtime.clone(),
                task: task.abort_handle(),
            }),
        }
    }

    /// Share as an executor reference for `subscribe`
    pub fn as_executor(&self) -> ExecutorRef {
        Arc::new(self.clone())
    }

    /// Stop the loop. Queued and future jobs are dropped.
    pub fn shutdown(&self) {
        self.inner.task.abort();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.tx.is_closed() || self.inner.task.is_finished()
    }
}

impl Executor for EventLoop {
    fn execute(&self, job: Job) {
        if self.inner.tx.send(job).is_err() {
            tracing::debug!("event loop closed, dropping job");
        }
    }
}

impl TimerService for EventLoop {
    fn schedule(&self, delay: Duration, job: Job) -> TimerHandle {
        let (handle, trigger) = TimerHandle::new();
        let tx = self.inner.tx.clone();

        let sleeper = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if trigger.is_cancelled() {
                return;
            }
            if tx.send(trigger.guard(job)).is_err() {
                tracing::debug!("event loop closed, dropping timer");
            }
        });

        let sleeper = sleeper.abort_handle();
        handle.on_cancel(move || sleeper.abort());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let event_loop = EventLoop::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            event_loop.execute(Box::new(move || seen.lock().push(i)));
        }

        let (tx, rx) = oneshot::channel();
        event_loop.execute(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.await.unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let event_loop = EventLoop::spawn();
        let start = Instant::now();

        let (tx, rx) = oneshot::channel();
        let handle = event_loop.schedule(
            Duration::from_millis(1000),
            Box::new(move || {
                let _ = tx.send(Instant::now());
            }),
        );

        let fired_at = rx.await.unwrap();
        assert!(fired_at - start >= Duration::from_millis(1000));
        assert!(handle.has_fired());
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_runs() {
        let event_loop = EventLoop::spawn();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let handle = event_loop.schedule(
            Duration::from_millis(500),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(event_loop.cancel(&handle));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_loop_alive() {
        let event_loop = EventLoop::spawn();
        event_loop.execute(Box::new(|| panic!("boom")));

        let (tx, rx) = oneshot::channel();
        event_loop.execute(Box::new(move || {
            let _ = tx.send(7);
        }));

        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_shutdown_drops_jobs() {
        let event_loop = EventLoop::spawn();
        event_loop.shutdown();
        tokio::task::yield_now().await;

        let (tx, rx) = oneshot::channel::<()>();
        event_loop.execute(Box::new(move || {
            let _ = tx.send(());
        }));

        // Sender is dropped with the job instead of running it
        assert!(rx.await.is_err());
        assert!(event_loop.is_shutdown());
    }
}
