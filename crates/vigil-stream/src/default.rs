//! Default stream - buffered producer with demand-regulated delivery

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use vigil_core::{
    Completion, CompletionSignal, ExecutorRef, StreamError, StreamMessage, StreamResult,
    Subscriber, Subscription, SubscriptionOption,
};

struct StreamState<T> {
    /// Written but not yet delivered
    queue: VecDeque<T>,
    /// Terminal outcome, delivered once the queue drains
    outcome: Option<StreamResult<()>>,
    /// Outstanding demand
    demand: u64,
    /// Parked subscriber; taken out while signals are delivered
    subscriber: Option<Box<dyn Subscriber<T>>>,
    executor: Option<ExecutorRef>,
    subscribed: bool,
    cancelled: bool,
    notify_cancellation: bool,
    /// Terminal signal delivered
    finished: bool,
    /// Elements ever written
    written: u64,
}

impl<T> StreamState<T> {
    fn is_closing(&self) -> bool {
        self.outcome.is_some() || self.finished || self.cancelled
    }
}

struct StreamInner<T> {
    state: Mutex<StreamState<T>>,
    completion: CompletionSignal,
}

enum Step<T> {
    Next(T),
    Finish(StreamResult<()>),
    Cancelled { notify: bool },
}

impl<T: Send + 'static> StreamInner<T> {
    fn schedule_drain(self: &Arc<Self>) {
        let executor = self.state.lock().executor.clone();
        if let Some(executor) = executor {
            let inner = Arc::clone(self);
            executor.execute(Box::new(move || inner.drain()));
        }
    }

    /// Deliver as much as demand allows. Runs on the subscription's executor.
    fn drain(&self) {
        let Some(mut subscriber) = self.state.lock().subscriber.take() else {
            return;
        };

        loop {
            let step = {
                let mut state = self.state.lock();
                if state.cancelled {
                    state.finished = true;
                    state.queue.clear();
                    Step::Cancelled {
                        notify: state.notify_cancellation,
                    }
                } else if state.demand > 0 && !state.queue.is_empty() {
                    state.demand -= 1;
                    match state.queue.pop_front() {
                        Some(item) => Step::Next(item),
                        None => continue,
                    }
                } else if state.queue.is_empty() && state.outcome.is_some() {
                    state.finished = true;
                    Step::Finish(state.outcome.take().unwrap_or(Ok(())))
                } else {
                    state.subscriber = Some(subscriber);
                    return;
                }
            };

            match step {
                Step::Next(item) => subscriber.on_next(item),
                Step::Finish(result) => {
                    match &result {
                        Ok(()) => subscriber.on_complete(),
                        Err(cause) => subscriber.on_error(cause.clone()),
                    }
                    self.completion.complete(result);
                    return;
                }
                Step::Cancelled { notify } => {
                    tracing::debug!("stream subscription cancelled");
                    if notify {
                        subscriber.on_error(StreamError::Cancelled);
                    }
                    self.completion.complete(Err(StreamError::Cancelled));
                    return;
                }
            }
        }
    }

    /// Fail the stream, discarding undelivered elements
    fn terminate(self: &Arc<Self>, cause: StreamError) {
        let subscribed = {
            let mut state = self.state.lock();
            if state.finished || state.cancelled || matches!(state.outcome, Some(Err(_))) {
                return;
            }
            state.queue.clear();
            state.outcome = Some(Err(cause.clone()));
            state.subscribed
        };

        tracing::debug!(%cause, "stream aborted");
        if subscribed {
            self.schedule_drain();
        } else {
            self.completion.complete(Err(cause));
        }
    }
}

/// Handle given to the subscriber
struct StreamSubscription<T> {
    inner: Arc<StreamInner<T>>,
}

impl<T: Send + 'static> Subscription for StreamSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.inner.terminate(StreamError::InvalidDemand(n));
            return;
        }

        {
            let mut state = self.inner.state.lock();
            if state.finished || state.cancelled {
                return;
            }
            state.demand = state.demand.saturating_add(n);
        }
        self.inner.schedule_drain();
    }

    fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.finished || state.cancelled {
                return;
            }
            state.cancelled = true;
            state.demand = 0;
            state.queue.clear();
        }
        self.inner.schedule_drain();
    }
}

/// Handle given to a rejected subscriber
struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Buffered stream with a single subscriber
///
/// Elements written before subscription are retained and delivered on demand.
/// Cloning yields another handle to the same stream.
pub struct DefaultStream<T> {
    inner: Arc<StreamInner<T>>,
}

impl<T> Clone for DefaultStream<T> {
    fn clone(&self) -> Self {
        DefaultStream {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> DefaultStream<T> {
    /// Create an open, empty stream
    pub fn new() -> Self {
        DefaultStream {
            inner: Arc::new(StreamInner {
                state: Mutex::new(StreamState {
                    queue: VecDeque::new(),
                    outcome: None,
                    demand: 0,
                    subscriber: None,
                    executor: None,
                    subscribed: false,
                    cancelled: false,
                    notify_cancellation: false,
                    finished: false,
                    written: 0,
                }),
                completion: CompletionSignal::new(),
            }),
        }
    }

    /// A closed stream that publishes `items` in order
    pub fn of<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let stream = Self::new();
        for item in items {
            stream.write(item);
        }
        stream.close();
        stream
    }

    /// Append an element. Returns false if the stream no longer accepts elements.
    pub fn write(&self, item: T) -> bool {
        let subscribed = {
            let mut state = self.inner.state.lock();
            if state.is_closing() {
                return false;
            }
            state.queue.push_back(item);
            state.written += 1;
            state.subscribed
        };

        if subscribed {
            self.inner.schedule_drain();
        }
        true
    }

    /// Complete normally once written elements are delivered
    pub fn close(&self) -> bool {
        self.close_with_outcome(Ok(()))
    }

    /// Fail once written elements are delivered
    pub fn close_with(&self, cause: StreamError) -> bool {
        self.close_with_outcome(Err(cause))
    }

    fn close_with_outcome(&self, outcome: StreamResult<()>) -> bool {
        let subscribed = {
            let mut state = self.inner.state.lock();
            if state.is_closing() {
                return false;
            }
            state.outcome = Some(outcome);
            state.subscribed
        };

        if subscribed {
            self.inner.schedule_drain();
        }
        true
    }

    /// Elements written but not yet delivered
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl<T: Send + 'static> Default for DefaultStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> StreamMessage<T> for DefaultStream<T> {
    fn is_open(&self) -> bool {
        !self.inner.state.lock().is_closing()
    }

    fn is_empty(&self) -> bool {
        let state = self.inner.state.lock();
        state.is_closing() && state.written == 0
    }

    fn demand(&self) -> u64 {
        self.inner.state.lock().demand
    }

    fn when_complete(&self) -> Completion {
        self.inner.completion.subscribe()
    }

    fn subscribe(
        &self,
        mut subscriber: Box<dyn Subscriber<T>>,
        executor: ExecutorRef,
        options: &[SubscriptionOption],
    ) {
        let accepted = {
            let mut state = self.inner.state.lock();
            if state.subscribed {
                false
            } else {
                state.subscribed = true;
                state.executor = Some(Arc::clone(&executor));
                state.notify_cancellation =
                    SubscriptionOption::contains(options, SubscriptionOption::NotifyCancellation);
                true
            }
        };

        if !accepted {
            tracing::debug!("rejecting second subscriber");
            executor.execute(Box::new(move || {
                subscriber.on_subscribe(Arc::new(NoopSubscription));
                subscriber.on_error(StreamError::AlreadySubscribed);
            }));
            return;
        }

        let inner = Arc::clone(&self.inner);
        executor.execute(Box::new(move || {
            let subscription: Arc<dyn Subscription> = Arc::new(StreamSubscription {
                inner: Arc::clone(&inner),
            });
            subscriber.on_subscribe(subscription);
            inner.state.lock().subscriber = Some(subscriber);
            inner.drain();
        }));
    }

    fn abort(&self) {
        self.inner.terminate(StreamError::Aborted);
    }

    fn abort_with(&self, cause: StreamError) {
        self.inner.terminate(cause);
    }
}
