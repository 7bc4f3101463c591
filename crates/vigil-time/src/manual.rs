//! Manual event loop - deterministic virtual time
//!
//! Nothing runs until the owner drives the loop:
//! - `run_pending()` drains the job queue
//! - `advance(dt)` moves virtual time forward, firing due timers in deadline
//!   order (FIFO for equal deadlines) and draining the queue after each fire

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use vigil_core::{Executor, Job, TimerHandle, TimerService, TimerTrigger};

struct TimerEntry {
    deadline: Duration,
    seq: u64,
    trigger: TimerTrigger,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap, earliest deadline must pop first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

#[derive(Default)]
struct ManualState {
    /// Virtual time since creation
    now: Duration,
    queue: VecDeque<Job>,
    timers: BinaryHeap<TimerEntry>,
    next_seq: u64,
    /// Total timers fired
    fired: u64,
}

impl ManualState {
    /// Drop cancelled timers sitting at the front of the heap
    fn prune(&mut self) {
        while self
            .timers
            .peek()
            .is_some_and(|entry| entry.trigger.is_cancelled())
        {
            self.timers.pop();
        }
    }
}

/// Serial execution context driven by virtual time
#[derive(Default)]
pub struct ManualEventLoop {
    state: Mutex<ManualState>,
}

impl ManualEventLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualEventLoop::default())
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Run queued jobs, including jobs they queue, until the queue is empty.
    /// Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Lock released before the job runs: jobs re-enter execute/schedule
            let job = self.state.lock().queue.pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Move virtual time forward by `dt`, firing every timer that falls due
    pub fn advance(&self, dt: Duration) {
        let target = self.now() + dt;
        self.advance_to(target);
    }

    /// Move virtual time forward to `target` (no-op if already past it)
    pub fn advance_to(&self, target: Duration) {
        self.run_pending();

        loop {
            let due = {
                let mut state = self.state.lock();
                state.prune();
                match state.timers.peek() {
                    Some(entry) if entry.deadline <= target => {
                        let entry = state.timers.pop();
                        if let Some(entry) = &entry {
                            state.now = state.now.max(entry.deadline);
                        }
                        entry
                    }
                    _ => None,
                }
            };

            let Some(entry) = due else {
                break;
            };

            if !entry.trigger.is_cancelled() {
                self.state.lock().fired += 1;
                self.execute(entry.trigger.guard(entry.job));
            }
            self.run_pending();
        }

        {
            let mut state = self.state.lock();
            state.now = state.now.max(target);
        }
        self.run_pending();
    }

    /// Timers still pending (not cancelled, not fired)
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|entry| !entry.trigger.is_cancelled())
            .count()
    }

    /// Deadline of the earliest pending timer
    pub fn next_deadline(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        state.prune();
        state.timers.peek().map(|entry| entry.deadline)
    }

    /// Total timers fired so far
    pub fn fired_timers(&self) -> u64 {
        self.state.lock().fired
    }

    /// Jobs waiting in the queue
    pub fn queued_jobs(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Executor for ManualEventLoop {
    fn execute(&self, job: Job) {
        self.state.lock().queue.push_back(job);
    }
}

impl TimerService for ManualEventLoop {
    fn schedule(&self, delay: Duration, job: Job) -> TimerHandle {
        let (handle, trigger) = TimerHandle::new();
        let mut state = self.state.lock();
        state.prune();
        let seq = state.next_seq;
        state.next_seq += 1;
        let deadline = state.now + delay;
        state.timers.push(TimerEntry {
            deadline,
            seq,
            trigger,
            job,
        });
        handle
    }
}
