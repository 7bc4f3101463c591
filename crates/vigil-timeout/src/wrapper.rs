//! Timeout stream - the public decorator
//!
//! Observational calls and aborts pass straight through to the wrapped
//! stream. `subscribe` never hands the consumer to the wrapped stream: a fresh
//! [`TimeoutGuard`] is built around it and subscribed instead.

use std::marker::PhantomData;
use std::time::Duration;

use vigil_core::{
    Completion, ExecutorRef, StreamError, StreamMessage, StreamResult, Subscriber,
    SubscriptionOption, TimeoutMode,
};

use crate::{TimeoutConfig, TimeoutGuard};

/// A stream that fails its consumer when progress stalls
///
/// Immutable once built; every subscription gets its own guard.
pub struct TimeoutStream<T, S> {
    delegate: S,
    config: TimeoutConfig,
    _marker: PhantomData<fn() -> T>,
}

/// Wrap `stream` so that each subscription is bounded by `deadline` under `mode`
pub fn wrap<T, S>(stream: S, deadline: Duration, mode: TimeoutMode) -> StreamResult<TimeoutStream<T, S>>
where
    S: StreamMessage<T>,
{
    TimeoutStream::new(stream, TimeoutConfig::new(deadline, mode))
}

impl<T, S> TimeoutStream<T, S>
where
    S: StreamMessage<T>,
{
    /// Fails with `StreamError::InvalidDeadline` for a zero deadline
    pub fn new(stream: S, config: TimeoutConfig) -> StreamResult<Self> {
        config.validate()?;
        Ok(TimeoutStream {
            delegate: stream,
            config,
            _marker: PhantomData,
        })
    }

    pub fn deadline(&self) -> Duration {
        self.config.deadline
    }

    pub fn mode(&self) -> TimeoutMode {
        self.config.mode
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// The wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.delegate
    }
}

impl<T, S> StreamMessage<T> for TimeoutStream<T, S>
where
    T: Send + 'static,
    S: StreamMessage<T>,
{
    fn is_open(&self) -> bool {
        self.delegate.is_open()
    }

    fn is_empty(&self) -> bool {
        self.delegate.is_empty()
    }

    fn demand(&self) -> u64 {
        self.delegate.demand()
    }

    fn when_complete(&self) -> Completion {
        self.delegate.when_complete()
    }

    fn subscribe(
        &self,
        subscriber: Box<dyn Subscriber<T>>,
        executor: ExecutorRef,
        options: &[SubscriptionOption],
    ) {
        let guard = TimeoutGuard::new(
            subscriber,
            executor.clone(),
            self.config.deadline,
            self.config.mode,
        );
        self.delegate.subscribe(Box::new(guard), executor, options);
    }

    fn abort(&self) {
        self.delegate.abort();
    }

    fn abort_with(&self, cause: StreamError) {
        self.delegate.abort_with(cause);
    }
}

/// `timeout` combinators for every stream
pub trait StreamTimeoutExt<T>: StreamMessage<T> + Sized {
    /// Bound each subscription by `deadline` under `mode`
    fn timeout(self, deadline: Duration, mode: TimeoutMode) -> StreamResult<TimeoutStream<T, Self>> {
        wrap(self, deadline, mode)
    }

    fn timeout_with(self, config: TimeoutConfig) -> StreamResult<TimeoutStream<T, Self>> {
        TimeoutStream::new(self, config)
    }
}

impl<T, S> StreamTimeoutExt<T> for S where S: StreamMessage<T> {}
