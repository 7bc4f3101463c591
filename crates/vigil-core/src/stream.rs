//! Push-style, demand-regulated stream contract
//!
//! A [`StreamMessage`] pushes elements to exactly one [`Subscriber`]. The
//! subscriber receives `on_subscribe` first, then at most as many `on_next`
//! calls as it has requested through its [`Subscription`], then exactly one
//! terminal signal: `on_complete` or `on_error`.
//!
//! All signals for a subscription are delivered from the executor passed to
//! `subscribe`. `Subscription::request` and `Subscription::cancel` may be called
//! from any thread and never deliver signals on the caller's stack.

use std::sync::Arc;

use crate::{Completion, ExecutorRef, StreamError};

/// Receiver of stream signals
pub trait Subscriber<T>: Send + 'static {
    /// First signal. The subscription is the only way to request elements.
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    fn on_next(&mut self, item: T);

    /// Terminal: failure
    fn on_error(&mut self, cause: StreamError);

    /// Terminal: success
    fn on_complete(&mut self);
}

/// Demand and cancellation handle held by a subscriber
pub trait Subscription: Send + Sync {
    /// Permit `n` more elements. Zero is a protocol violation.
    fn request(&self, n: u64);

    /// Stop the subscription. Idempotent.
    fn cancel(&self);
}

/// Options passed through `subscribe`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionOption {
    /// Deliver `StreamError::Cancelled` to the subscriber when it cancels
    NotifyCancellation,
}

impl SubscriptionOption {
    #[inline]
    pub fn contains(options: &[SubscriptionOption], option: SubscriptionOption) -> bool {
        options.contains(&option)
    }
}

/// A push-style, demand-regulated sequence of elements with a single subscriber
pub trait StreamMessage<T>: Send + Sync {
    /// Still accepting or delivering elements?
    fn is_open(&self) -> bool;

    /// Closed without ever producing an element?
    fn is_empty(&self) -> bool;

    /// Outstanding demand granted by the subscriber
    fn demand(&self) -> u64;

    /// Resolved exactly once when the stream terminates
    fn when_complete(&self) -> Completion;

    fn subscribe(
        &self,
        subscriber: Box<dyn Subscriber<T>>,
        executor: ExecutorRef,
        options: &[SubscriptionOption],
    );

    /// Terminate with `StreamError::Aborted`. Idempotent.
    fn abort(&self);

    /// Terminate with `cause`. Idempotent.
    fn abort_with(&self, cause: StreamError);
}

impl<T, S> StreamMessage<T> for Arc<S>
where
    S: StreamMessage<T> + ?Sized,
{
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn demand(&self) -> u64 {
        (**self).demand()
    }

    fn when_complete(&self) -> Completion {
        (**self).when_complete()
    }

    fn subscribe(
        &self,
        subscriber: Box<dyn Subscriber<T>>,
        executor: ExecutorRef,
        options: &[SubscriptionOption],
    ) {
        (**self).subscribe(subscriber, executor, options)
    }

    fn abort(&self) {
        (**self).abort()
    }

    fn abort_with(&self, cause: StreamError) {
        (**self).abort_with(cause)
    }
}
