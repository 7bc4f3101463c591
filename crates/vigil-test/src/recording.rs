//! Recording subscribers - Timestamped observation with scripted demand
//!
//! A [`ScriptedSubscriber`] requests elements according to a [`RequestPlan`]
//! and writes everything it sees into a shared [`Recording`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use vigil_core::{
    Completion, CompletionSignal, ExecutorRef, StreamError, Subscriber, Subscription,
    TimeoutError,
};
use vigil_time::ManualEventLoop;

/// Source of timestamps for recorded events
pub type Clock = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Timestamps in virtual time
pub fn virtual_clock(event_loop: &Arc<ManualEventLoop>) -> Clock {
    let event_loop = Arc::clone(event_loop);
    Arc::new(move || event_loop.now())
}

/// Timestamps relative to now on the tokio clock (honors paused time)
pub fn tokio_clock() -> Clock {
    let origin = tokio::time::Instant::now();
    Arc::new(move || origin.elapsed())
}

/// How a subscription ended
#[derive(Clone, Debug, PartialEq)]
pub enum Terminal {
    Complete,
    TimedOut(TimeoutError),
    Cancelled,
    Failed(String),
}

impl Terminal {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Terminal::TimedOut(_))
    }
}

impl From<&StreamError> for Terminal {
    fn from(cause: &StreamError) -> Self {
        match cause {
            StreamError::Timeout(timeout) => Terminal::TimedOut(*timeout),
            StreamError::Cancelled => Terminal::Cancelled,
            other => Terminal::Failed(other.to_string()),
        }
    }
}

/// One observed signal
#[derive(Clone, Debug, PartialEq)]
pub enum Observed<T> {
    Subscribed,
    Next(T),
    Terminal(Terminal),
}

/// A signal and when it arrived
#[derive(Clone, Debug, PartialEq)]
pub struct Event<T> {
    pub at: Duration,
    pub signal: Observed<T>,
}

struct RecordingInner<T> {
    clock: Clock,
    events: Mutex<Vec<Event<T>>>,
    done: CompletionSignal,
}

/// Shared log of what a consumer observed
pub struct Recording<T> {
    inner: Arc<RecordingInner<T>>,
}

impl<T> Clone for Recording<T> {
    fn clone(&self) -> Self {
        Recording {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Recording<T> {
    pub fn new(clock: Clock) -> Self {
        Recording {
            inner: Arc::new(RecordingInner {
                clock,
                events: Mutex::new(Vec::new()),
                done: CompletionSignal::new(),
            }),
        }
    }

    fn push(&self, signal: Observed<T>) {
        let at = (self.inner.clock)();
        self.inner.events.lock().push(Event { at, signal });
    }

    fn push_terminal(&self, terminal: Terminal, result: Result<(), StreamError>) {
        self.push(Observed::Terminal(terminal));
        self.inner.done.complete(result);
    }

    pub fn events(&self) -> Vec<Event<T>> {
        self.inner.events.lock().clone()
    }

    /// Elements in arrival order
    pub fn items(&self) -> Vec<T> {
        self.inner
            .events
            .lock()
            .iter()
            .filter_map(|event| match &event.signal {
                Observed::Next(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    /// Arrival times of elements
    pub fn item_times(&self) -> Vec<Duration> {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|event| matches!(event.signal, Observed::Next(_)))
            .map(|event| event.at)
            .collect()
    }

    /// First terminal signal, if any
    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal_event().map(|(_, terminal)| terminal)
    }

    pub fn terminal_at(&self) -> Option<Duration> {
        self.terminal_event().map(|(at, _)| at)
    }

    fn terminal_event(&self) -> Option<(Duration, Terminal)> {
        self.inner
            .events
            .lock()
            .iter()
            .find_map(|event| match &event.signal {
                Observed::Terminal(terminal) => Some((event.at, terminal.clone())),
                _ => None,
            })
    }

    pub fn terminal_count(&self) -> usize {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|event| matches!(event.signal, Observed::Terminal(_)))
            .count()
    }

    /// Signals recorded after the first terminal
    pub fn after_terminal(&self) -> usize {
        let events = self.inner.events.lock();
        events
            .iter()
            .position(|event| matches!(event.signal, Observed::Terminal(_)))
            .map_or(0, |idx| events.len() - idx - 1)
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_done()
    }

    /// Resolves with the terminal outcome
    pub fn completion(&self) -> Completion {
        self.inner.done.subscribe()
    }
}

/// A demand request, issued inline when `delay` is zero
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    pub delay: Duration,
    pub count: u64,
}

impl Step {
    pub fn now(count: u64) -> Self {
        Step {
            delay: Duration::ZERO,
            count,
        }
    }

    pub fn after(delay: Duration, count: u64) -> Self {
        Step { delay, count }
    }
}

/// When and how much a scripted consumer requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestPlan {
    /// Issued from `on_subscribe`
    pub first: Step,
    /// Issued after every element
    pub next: Option<Step>,
    /// Cancel the subscription this long after `on_subscribe`
    pub cancel_after: Option<Duration>,
}

impl RequestPlan {
    /// Request everything at once
    pub fn unbounded() -> Self {
        Self::upfront(u64::MAX)
    }

    /// Request `count` at once and nothing after
    pub fn upfront(count: u64) -> Self {
        RequestPlan {
            first: Step::now(count),
            next: None,
            cancel_after: None,
        }
    }

    /// One-at-a-time consumer
    pub fn paced(first: Step, next: Step) -> Self {
        RequestPlan {
            first,
            next: Some(next),
            cancel_after: None,
        }
    }

    pub fn with_cancel_after(mut self, delay: Duration) -> Self {
        self.cancel_after = Some(delay);
        self
    }
}

/// Consumer that follows a [`RequestPlan`] and records into a [`Recording`]
pub struct ScriptedSubscriber<T> {
    plan: RequestPlan,
    executor: ExecutorRef,
    recording: Recording<T>,
    subscription: Option<Arc<dyn Subscription>>,
}

impl<T: Clone + Send + 'static> ScriptedSubscriber<T> {
    /// `executor` schedules delayed requests; pass the one the stream runs on
    pub fn new(plan: RequestPlan, executor: ExecutorRef, recording: Recording<T>) -> Self {
        ScriptedSubscriber {
            plan,
            executor,
            recording,
            subscription: None,
        }
    }

    fn issue(&self, step: Step) {
        let Some(subscription) = self.subscription.clone() else {
            return;
        };
        if step.delay.is_zero() {
            subscription.request(step.count);
        } else {
            let count = step.count;
            self.executor
                .schedule(step.delay, Box::new(move || subscription.request(count)));
        }
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for ScriptedSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.recording.push(Observed::Subscribed);

        if let Some(delay) = self.plan.cancel_after {
            let target = Arc::clone(&subscription);
            self.executor.schedule(delay, Box::new(move || target.cancel()));
        }

        self.subscription = Some(subscription);
        self.issue(self.plan.first);
    }

    fn on_next(&mut self, item: T) {
        self.recording.push(Observed::Next(item));
        if let Some(step) = self.plan.next {
            self.issue(step);
        }
    }

    fn on_error(&mut self, cause: StreamError) {
        tracing::debug!(%cause, "consumer observed error");
        self.recording
            .push_terminal(Terminal::from(&cause), Err(cause));
        self.subscription = None;
    }

    fn on_complete(&mut self) {
        self.recording.push_terminal(Terminal::Complete, Ok(()));
        self.subscription = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{StreamMessage, TimeoutMode};
    use vigil_stream::DefaultStream;

    fn setup() -> (Arc<ManualEventLoop>, Recording<u32>) {
        let event_loop = ManualEventLoop::new();
        let recording = Recording::new(virtual_clock(&event_loop));
        (event_loop, recording)
    }

    #[test]
    fn test_terminal_from_error() {
        let timeout = TimeoutError::new(Duration::from_secs(1), TimeoutMode::UntilFirst);
        assert_eq!(
            Terminal::from(&StreamError::from(timeout)),
            Terminal::TimedOut(timeout)
        );
        assert_eq!(Terminal::from(&StreamError::Cancelled), Terminal::Cancelled);
        assert_eq!(
            Terminal::from(&StreamError::Aborted),
            Terminal::Failed("Stream aborted".into())
        );
    }

    #[test]
    fn test_paced_requests_follow_plan() {
        let (event_loop, recording) = setup();
        let stream = DefaultStream::of([1u32, 2, 3]);
        let consumer = ScriptedSubscriber::new(
            RequestPlan::paced(Step::now(1), Step::after(Duration::from_millis(100), 1)),
            event_loop.clone(),
            recording.clone(),
        );

        stream.subscribe(Box::new(consumer), event_loop.clone(), &[]);
        event_loop.advance(Duration::from_secs(1));

        assert_eq!(recording.items(), vec![1, 2, 3]);
        assert_eq!(
            recording.item_times(),
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200)
            ]
        );
        // Completion needs no demand
        assert_eq!(recording.terminal(), Some(Terminal::Complete));
        assert_eq!(recording.terminal_at(), Some(Duration::from_millis(200)));
        assert!(recording.is_done());
    }

    #[test]
    fn test_cancel_after_delay() {
        let (event_loop, recording) = setup();
        let stream: DefaultStream<u32> = DefaultStream::new();
        let consumer = ScriptedSubscriber::new(
            RequestPlan::unbounded().with_cancel_after(Duration::from_millis(50)),
            event_loop.clone(),
            recording.clone(),
        );

        stream.subscribe(Box::new(consumer), event_loop.clone(), &[]);
        event_loop.advance(Duration::from_millis(10));
        stream.write(7);
        event_loop.advance(Duration::from_millis(100));

        assert_eq!(recording.items(), vec![7]);
        // Plain stream has no cancel notification by default
        assert_eq!(recording.terminal(), None);
        assert!(!stream.is_open());
    }

    #[test]
    fn test_after_terminal_counts_stray_signals() {
        let (_event_loop, recording) = setup();
        recording.push(Observed::Subscribed);
        recording.push_terminal(Terminal::Complete, Ok(()));
        assert_eq!(recording.after_terminal(), 0);

        recording.push(Observed::Next(1));
        assert_eq!(recording.after_terminal(), 1);
        assert_eq!(recording.terminal_count(), 1);
    }
}
