//! Execution contexts and the timer service
//!
//! Every subscription is driven by one logical execution context. Jobs posted to
//! an [`Executor`] run one at a time, in submission order. A [`TimerService`]
//! posts a job after a delay and hands back a [`TimerHandle`]; cancelling the
//! handle and firing the job are mutually exclusive.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// A unit of work for an execution context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serial execution context
pub trait Executor: Send + Sync {
    /// Queue a job. Jobs never run on the caller's stack.
    fn execute(&self, job: Job);
}

/// Cancellable delayed execution
pub trait TimerService: Send + Sync {
    /// Run `job` on the execution context once `delay` has elapsed
    fn schedule(&self, delay: Duration, job: Job) -> TimerHandle;

    /// Cancel a pending fire. True iff the cancellation preempted the fire.
    fn cancel(&self, handle: &TimerHandle) -> bool {
        handle.cancel()
    }
}

/// An execution context that can also schedule timers
pub trait EventExecutor: Executor + TimerService {}

impl<T: Executor + TimerService + ?Sized> EventExecutor for T {}

/// Shared reference to an event executor
pub type ExecutorRef = Arc<dyn EventExecutor>;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

struct TimerShared {
    state: AtomicU8,
    /// Releases scheduler resources (e.g. a sleeping task) on cancel
    on_cancel: Mutex<Option<CancelHook>>,
}

/// Owner side of a single scheduled fire
///
/// INVARIANT: at most one of `cancel()` and the fire succeeds.
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

/// Scheduler side of a single scheduled fire
pub struct TimerTrigger {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Create a pending handle and the trigger the scheduler fires through
    pub fn new() -> (TimerHandle, TimerTrigger) {
        let shared = Arc::new(TimerShared {
            state: AtomicU8::new(PENDING),
            on_cancel: Mutex::new(None),
        });
        (
            TimerHandle {
                shared: Arc::clone(&shared),
            },
            TimerTrigger { shared },
        )
    }

    /// Cancel the fire. Returns false if it was already dispatched or cancelled.
    pub fn cancel(&self) -> bool {
        let won = self
            .shared
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            if let Some(hook) = self.shared.on_cancel.lock().take() {
                hook();
            }
        }
        won
    }

    /// Register a hook run once if this handle is cancelled
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.shared.on_cancel.lock();
        match self.shared.state.load(Ordering::Acquire) {
            PENDING => *slot = Some(Box::new(hook)),
            CANCELLED => {
                drop(slot);
                hook();
            }
            _ => {}
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == PENDING
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == CANCELLED
    }

    #[inline]
    pub fn has_fired(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == FIRED
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("TimerHandle").field("state", &state).finish()
    }
}

impl TimerTrigger {
    /// Claim the fire. Returns false if the handle was cancelled first.
    pub fn try_fire(&self) -> bool {
        let won = self
            .shared
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            self.shared.on_cancel.lock().take();
        }
        won
    }

    /// Wrap `job` so that it only runs if the fire is claimed when the job runs
    pub fn guard(self, job: Job) -> Job {
        Box::new(move || {
            if self.try_fire() {
                job();
            }
        })
    }

    /// Has the owner already cancelled?
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == CANCELLED
    }
}
