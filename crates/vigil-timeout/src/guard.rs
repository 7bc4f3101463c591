//! Timeout guard - per-subscription deadline enforcement
//!
//! The guard sits between the upstream producer and the real consumer:
//! - upstream sees the guard as its subscriber
//! - the consumer sees the guard as its subscription
//!
//! Upstream signals and timer fires arrive on the subscription's executor and
//! are therefore serialized. `cancel()` may arrive from any thread, so the
//! terminal slot is claimed with a compare-and-set: whichever of upstream
//! terminal, timer fire or cancel claims it first is the only terminal signal
//! the consumer ever sees.
//!
//! No lock is held while the consumer runs. A consumer may call `request(n)`
//! from inside a callback and the upstream may answer inline; such signals
//! are queued and delivered in order once the running callback returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use vigil_core::{
    ExecutorRef, StreamError, Subscriber, Subscription, TimeoutError, TimeoutMode, TimerHandle,
};

use crate::{transition, GuardEvent, GuardState, Outcome, TimerAction};

/// Timer bookkeeping, guarded by one short lock
struct TimerSlot {
    state: GuardState,
    /// The single live timer, if armed
    handle: Option<TimerHandle>,
    /// Incremented on every arm; fires carrying an older epoch are stale
    epoch: u64,
}

/// A signal on its way to the consumer
enum Signal<T> {
    Subscribe(Arc<dyn Subscription>),
    Next(T),
    Complete,
    Error(StreamError),
}

/// The consumer and the signals waiting for it
struct Outbox<T> {
    /// `None` while a callback runs or after the terminal signal
    subscriber: Option<Box<dyn Subscriber<T>>>,
    backlog: VecDeque<Signal<T>>,
    /// Terminal signal delivered, consumer dropped
    released: bool,
}

struct GuardInner<T> {
    me: Weak<GuardInner<T>>,
    deadline: Duration,
    mode: TimeoutMode,
    executor: ExecutorRef,
    /// Claimed exactly once by the first terminal event
    terminal: AtomicBool,
    slot: Mutex<TimerSlot>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    outbox: Mutex<Outbox<T>>,
}

impl<T: Send + 'static> GuardInner<T> {
    #[inline]
    fn claim_terminal(&self) -> bool {
        self.terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Evaluate `event` and apply its timer action.
    /// Terminal events must have claimed the terminal slot first.
    fn step(&self, event: GuardEvent) -> Outcome {
        let mut slot = self.slot.lock();
        let t = transition(self.mode, slot.state, event);

        match t.timer {
            TimerAction::Keep => {}
            TimerAction::Arm => self.arm(&mut slot),
            TimerAction::Rearm => {
                if let Some(old) = slot.handle.take() {
                    old.cancel();
                }
                self.arm(&mut slot);
            }
            TimerAction::Cancel => {
                if let Some(old) = slot.handle.take() {
                    old.cancel();
                }
                tracing::debug!(epoch = slot.epoch, "deadline timer disarmed");
            }
        }

        slot.state = t.next;
        t.outcome
    }

    fn arm(&self, slot: &mut TimerSlot) {
        slot.epoch += 1;
        let epoch = slot.epoch;
        let me = self.me.clone();

        let handle = self.executor.schedule(
            self.deadline,
            Box::new(move || {
                if let Some(guard) = me.upgrade() {
                    guard.on_timer_fired(epoch);
                }
            }),
        );
        slot.handle = Some(handle);

        tracing::debug!(deadline = ?self.deadline, mode = %self.mode, epoch, "deadline timer armed");
    }

    fn on_subscribe(&self, upstream: Arc<dyn Subscription>) {
        {
            let mut current = self.upstream.lock();
            if current.is_some() {
                drop(current);
                tracing::debug!("duplicate subscription, cancelling it");
                upstream.cancel();
                return;
            }
            *current = Some(upstream);
        }

        // Stored before the step: a racing cancel() either takes it or is seen here
        if self.is_terminal() || self.step(GuardEvent::Subscribe) != Outcome::Forward {
            tracing::debug!("subscription arrived after terminal, cancelling it");
            let upstream = self.upstream.lock().take();
            if let Some(upstream) = upstream {
                upstream.cancel();
            }
            return;
        }

        if let Some(me) = self.me.upgrade() {
            self.deliver(Signal::Subscribe(me));
        }
    }

    fn on_next(&self, item: T) {
        if self.is_terminal() || self.step(GuardEvent::Next) != Outcome::Forward {
            tracing::trace!("element after terminal, dropped");
            return;
        }

        tracing::trace!(mode = %self.mode, "element forwarded");
        self.deliver(Signal::Next(item));
    }

    fn on_upstream_terminal(&self, event: GuardEvent, cause: Option<StreamError>) {
        if !self.claim_terminal() {
            tracing::debug!(?event, "upstream terminal after terminal, ignored");
            return;
        }

        if self.step(event) != Outcome::Forward {
            return;
        }

        self.upstream.lock().take();
        self.deliver(match cause {
            Some(cause) => Signal::Error(cause),
            None => Signal::Complete,
        });
    }

    fn on_timer_fired(&self, epoch: u64) {
        {
            let slot = self.slot.lock();
            if slot.epoch != epoch || slot.state != GuardState::Armed {
                tracing::debug!(epoch, current = slot.epoch, "stale deadline timer ignored");
                return;
            }
        }

        if !self.claim_terminal() {
            return;
        }

        if self.step(GuardEvent::TimerFired) != Outcome::TimedOut {
            return;
        }

        tracing::warn!(deadline = ?self.deadline, mode = %self.mode, "stream deadline elapsed, cancelling upstream");

        let upstream = self.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }

        let error = TimeoutError::new(self.deadline, self.mode);
        self.deliver(Signal::Error(error.into()));
    }

    /// Queue `signal` and, unless a callback is already running further up
    /// the stack, drain the backlog into the consumer.
    /// The consumer is released after the terminal signal.
    fn deliver(&self, signal: Signal<T>) {
        let mut subscriber = {
            let mut outbox = self.outbox.lock();
            if outbox.released {
                return;
            }
            outbox.backlog.push_back(signal);
            match outbox.subscriber.take() {
                Some(subscriber) => subscriber,
                None => return,
            }
        };

        loop {
            let signal = {
                let mut outbox = self.outbox.lock();
                match outbox.backlog.pop_front() {
                    Some(signal) => signal,
                    None => {
                        outbox.subscriber = Some(subscriber);
                        return;
                    }
                }
            };

            let terminal = match signal {
                Signal::Subscribe(subscription) => {
                    subscriber.on_subscribe(subscription);
                    false
                }
                Signal::Next(item) => {
                    subscriber.on_next(item);
                    false
                }
                Signal::Complete => {
                    subscriber.on_complete();
                    true
                }
                Signal::Error(cause) => {
                    subscriber.on_error(cause);
                    true
                }
            };

            if terminal {
                let mut outbox = self.outbox.lock();
                outbox.released = true;
                outbox.backlog.clear();
                return;
            }
        }
    }

    fn state(&self) -> GuardState {
        self.slot.lock().state
    }
}

impl<T: Send + 'static> Subscription for GuardInner<T> {
    fn request(&self, n: u64) {
        if self.is_terminal() {
            return;
        }

        let upstream = self.upstream.lock().clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        if !self.claim_terminal() {
            return;
        }

        if self.step(GuardEvent::Cancel) != Outcome::Cancelled {
            return;
        }

        tracing::debug!("subscription cancelled by consumer");

        let upstream = self.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }

        // Notify from the executor: cancel() may run inside a consumer callback
        if let Some(me) = self.me.upgrade() {
            self.executor.execute(Box::new(move || {
                me.deliver(Signal::Error(StreamError::Cancelled));
            }));
        }
    }
}

impl<T> Drop for GuardInner<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().handle.take() {
            handle.cancel();
        }
    }
}

/// The subscriber a timeout stream hands to its upstream
///
/// One guard is created per subscription and owns that subscription's timer
/// and upstream handle. The consumer only ever sees the guard as its
/// subscription.
pub struct TimeoutGuard<T> {
    inner: Arc<GuardInner<T>>,
}

impl<T: Send + 'static> TimeoutGuard<T> {
    pub fn new(
        subscriber: Box<dyn Subscriber<T>>,
        executor: ExecutorRef,
        deadline: Duration,
        mode: TimeoutMode,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| GuardInner {
            me: me.clone(),
            deadline,
            mode,
            executor,
            terminal: AtomicBool::new(false),
            slot: Mutex::new(TimerSlot {
                state: GuardState::Idle,
                handle: None,
                epoch: 0,
            }),
            upstream: Mutex::new(None),
            outbox: Mutex::new(Outbox {
                subscriber: Some(subscriber),
                backlog: VecDeque::new(),
                released: false,
            }),
        });

        TimeoutGuard { inner }
    }

    /// Current state of the guard's state machine
    pub fn state(&self) -> GuardState {
        self.inner.state()
    }

    /// The handle the consumer receives in `on_subscribe`
    pub fn subscription(&self) -> Arc<dyn Subscription> {
        self.inner.clone()
    }

    pub fn deadline(&self) -> Duration {
        self.inner.deadline
    }

    pub fn mode(&self) -> TimeoutMode {
        self.inner.mode
    }
}

impl<T: Send + 'static> Subscriber<T> for TimeoutGuard<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.inner.on_next(item);
    }

    fn on_error(&mut self, cause: StreamError) {
        self.inner.on_upstream_terminal(GuardEvent::Error, Some(cause));
    }

    fn on_complete(&mut self) {
        self.inner.on_upstream_terminal(GuardEvent::Complete, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use vigil_time::ManualEventLoop;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Subscribed,
        Next(u32),
        Complete,
        Timeout(Duration),
        Cancelled,
        Error(String),
    }

    type Log = Arc<Mutex<Vec<Seen>>>;

    struct Observer {
        log: Log,
        handle: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
    }

    impl Subscriber<u32> for Observer {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
            self.log.lock().push(Seen::Subscribed);
            *self.handle.lock() = Some(subscription);
        }

        fn on_next(&mut self, item: u32) {
            self.log.lock().push(Seen::Next(item));
        }

        fn on_error(&mut self, cause: StreamError) {
            let seen = match cause {
                StreamError::Timeout(t) => Seen::Timeout(t.deadline),
                StreamError::Cancelled => Seen::Cancelled,
                other => Seen::Error(other.to_string()),
            };
            self.log.lock().push(seen);
        }

        fn on_complete(&mut self) {
            self.log.lock().push(Seen::Complete);
        }
    }

    /// Upstream stand-in that records demand and cancellation
    #[derive(Default)]
    struct FakeUpstream {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Subscription for FakeUpstream {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        event_loop: Arc<ManualEventLoop>,
        guard: TimeoutGuard<u32>,
        upstream: Arc<FakeUpstream>,
        log: Log,
        consumer_handle: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
    }

    fn harness(mode: TimeoutMode) -> Harness {
        let event_loop = ManualEventLoop::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let consumer_handle = Arc::new(Mutex::new(None));
        let observer = Box::new(Observer {
            log: Arc::clone(&log),
            handle: Arc::clone(&consumer_handle),
        });

        let mut guard = TimeoutGuard::new(
            observer,
            event_loop.clone(),
            Duration::from_millis(1000),
            mode,
        );
        let upstream = Arc::new(FakeUpstream::default());
        guard.on_subscribe(upstream.clone());

        Harness {
            event_loop,
            guard,
            upstream,
            log,
            consumer_handle,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    impl Harness {
        fn consumer_subscription(&self) -> Arc<dyn Subscription> {
            self.consumer_handle.lock().clone().unwrap()
        }

        fn seen(&self) -> Vec<Seen> {
            self.log.lock().clone()
        }
    }

    #[test]
    fn test_subscribe_arms_and_forwards() {
        let h = harness(TimeoutMode::UntilNext);

        assert_eq!(h.guard.state(), GuardState::Armed);
        assert_eq!(h.event_loop.pending_timers(), 1);
        assert_eq!(h.seen(), vec![Seen::Subscribed]);

        // Consumer demand reaches upstream through the guard
        h.consumer_subscription().request(3);
        assert_eq!(h.upstream.requested.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timer_fire_cancels_upstream_and_fails_consumer() {
        let h = harness(TimeoutMode::UntilNext);

        h.event_loop.advance(ms(999));
        assert_eq!(h.seen(), vec![Seen::Subscribed]);

        h.event_loop.advance(ms(1));
        assert_eq!(h.seen(), vec![Seen::Subscribed, Seen::Timeout(ms(1000))]);
        assert!(h.upstream.cancelled.load(Ordering::SeqCst));
        assert_eq!(h.guard.state(), GuardState::Terminal);
    }

    #[test]
    fn test_until_next_rearms_on_element() {
        let mut h = harness(TimeoutMode::UntilNext);

        h.event_loop.advance(ms(900));
        h.guard.on_next(1);
        h.event_loop.advance(ms(900));
        h.guard.on_next(2);
        h.event_loop.advance(ms(900));
        h.guard.on_complete();
        h.event_loop.advance(ms(5000));

        assert_eq!(
            h.seen(),
            vec![Seen::Subscribed, Seen::Next(1), Seen::Next(2), Seen::Complete]
        );
        assert_eq!(h.event_loop.pending_timers(), 0);
        assert!(!h.upstream.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_until_first_disarms_after_first_element() {
        let mut h = harness(TimeoutMode::UntilFirst);

        h.event_loop.advance(ms(500));
        h.guard.on_next(1);
        assert_eq!(h.guard.state(), GuardState::Disarmed);
        assert_eq!(h.event_loop.pending_timers(), 0);

        h.event_loop.advance(ms(10_000));
        h.guard.on_next(2);
        h.guard.on_complete();

        assert_eq!(
            h.seen(),
            vec![Seen::Subscribed, Seen::Next(1), Seen::Next(2), Seen::Complete]
        );
    }

    #[test]
    fn test_until_eos_bounds_whole_subscription() {
        let mut h = harness(TimeoutMode::UntilEos);

        for i in 0..5 {
            h.event_loop.advance(ms(150));
            h.guard.on_next(i);
        }
        assert_eq!(h.event_loop.pending_timers(), 1);

        h.event_loop.advance(ms(250));
        assert_eq!(h.seen().last(), Some(&Seen::Timeout(ms(1000))));

        // Late upstream signals are ignored
        h.guard.on_next(99);
        h.guard.on_complete();
        assert_eq!(h.seen().len(), 7);
    }

    #[test]
    fn test_upstream_error_forwarded_unchanged() {
        let mut h = harness(TimeoutMode::UntilNext);

        h.guard.on_error(StreamError::InvalidDemand(0));
        h.event_loop.advance(ms(5000));

        assert_eq!(
            h.seen(),
            vec![
                Seen::Subscribed,
                Seen::Error("Invalid demand: 0 (must be positive)".into())
            ]
        );
        assert_eq!(h.event_loop.fired_timers(), 0);
    }

    #[test]
    fn test_cancel_notifies_consumer_once() {
        let mut h = harness(TimeoutMode::UntilNext);
        let subscription = h.consumer_subscription();

        subscription.cancel();
        subscription.cancel();
        // Not delivered inline
        assert_eq!(h.seen(), vec![Seen::Subscribed]);

        h.event_loop.run_pending();
        h.guard.on_complete();
        h.event_loop.advance(ms(5000));

        assert_eq!(h.seen(), vec![Seen::Subscribed, Seen::Cancelled]);
        assert!(h.upstream.cancelled.load(Ordering::SeqCst));
        assert_eq!(h.event_loop.pending_timers(), 0);
    }

    #[test]
    fn test_request_after_terminal_is_noop() {
        let mut h = harness(TimeoutMode::UntilNext);
        let subscription = h.consumer_subscription();

        h.guard.on_complete();
        subscription.request(10);
        subscription.cancel();
        h.event_loop.run_pending();

        assert_eq!(h.upstream.requested.load(Ordering::SeqCst), 0);
        assert!(!h.upstream.cancelled.load(Ordering::SeqCst));
        assert_eq!(h.seen(), vec![Seen::Subscribed, Seen::Complete]);
    }

    #[test]
    fn test_duplicate_subscription_cancelled() {
        let mut h = harness(TimeoutMode::UntilNext);
        let second = Arc::new(FakeUpstream::default());

        h.guard.on_subscribe(second.clone());

        assert!(second.cancelled.load(Ordering::SeqCst));
        assert!(!h.upstream.cancelled.load(Ordering::SeqCst));
        assert_eq!(h.seen(), vec![Seen::Subscribed]);
    }

    #[test]
    fn test_stale_epoch_is_ignored() {
        let mut h = harness(TimeoutMode::UntilNext);

        h.event_loop.advance(ms(500));
        h.guard.on_next(1);

        // A fire from the first arm must not end the subscription
        h.guard.inner.on_timer_fired(1);
        assert_eq!(h.guard.state(), GuardState::Armed);

        h.event_loop.advance(ms(1000));
        assert_eq!(h.seen().last(), Some(&Seen::Timeout(ms(1000))));
    }

    /// Upstream that answers `request` by delivering on the caller's stack
    struct InlineUpstream {
        guard: Weak<GuardInner<u32>>,
        sent: AtomicU64,
        limit: u64,
    }

    impl Subscription for InlineUpstream {
        fn request(&self, n: u64) {
            let Some(guard) = self.guard.upgrade() else {
                return;
            };
            for _ in 0..n {
                let item = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
                if item > self.limit {
                    guard.on_upstream_terminal(GuardEvent::Complete, None);
                    return;
                }
                guard.on_next(item as u32);
            }
        }

        fn cancel(&self) {}
    }

    /// Requests one element at subscription and one more per element
    struct OneByOne {
        log: Log,
        subscription: Option<Arc<dyn Subscription>>,
    }

    impl Subscriber<u32> for OneByOne {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
            self.log.lock().push(Seen::Subscribed);
            subscription.request(1);
            self.subscription = Some(subscription);
        }

        fn on_next(&mut self, item: u32) {
            self.log.lock().push(Seen::Next(item));
            if let Some(subscription) = &self.subscription {
                subscription.request(1);
            }
        }

        fn on_error(&mut self, cause: StreamError) {
            self.log.lock().push(Seen::Error(cause.to_string()));
        }

        fn on_complete(&mut self) {
            self.log.lock().push(Seen::Complete);
        }
    }

    #[test]
    fn test_inline_delivery_from_request_is_queued_in_order() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let event_loop = ManualEventLoop::new();
            let log: Log = Arc::new(Mutex::new(Vec::new()));
            let consumer = Box::new(OneByOne {
                log: Arc::clone(&log),
                subscription: None,
            });
            let mut guard = TimeoutGuard::new(consumer, event_loop.clone(), ms(1000), TimeoutMode::UntilNext);
            let upstream = Arc::new(InlineUpstream {
                guard: Arc::downgrade(&guard.inner),
                sent: AtomicU64::new(0),
                limit: 3,
            });

            guard.on_subscribe(upstream);
            let seen = log.lock().clone();
            let _ = done_tx.send((seen, event_loop.pending_timers(), guard.state()));
        });

        let (seen, pending, state) = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("guard blocked on a signal delivered from inside request()");
        assert_eq!(
            seen,
            vec![
                Seen::Subscribed,
                Seen::Next(1),
                Seen::Next(2),
                Seen::Next(3),
                Seen::Complete
            ]
        );
        assert_eq!(pending, 0);
        assert_eq!(state, GuardState::Terminal);
    }

    #[test]
    fn test_cancel_before_subscribe_cancels_upstream() {
        let event_loop = ManualEventLoop::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let observer = Box::new(Observer {
            log: Arc::clone(&log),
            handle: Arc::new(Mutex::new(None)),
        });
        let mut guard = TimeoutGuard::new(observer, event_loop.clone(), ms(1000), TimeoutMode::UntilNext);
        let upstream = Arc::new(FakeUpstream::default());

        guard.subscription().cancel();
        guard.on_subscribe(upstream.clone());
        event_loop.advance(ms(5000));

        assert!(upstream.cancelled.load(Ordering::SeqCst));
        assert_eq!(*log.lock(), vec![Seen::Cancelled]);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn test_cancel_racing_subscribe_always_reaches_upstream() {
        for _ in 0..200 {
            let event_loop = ManualEventLoop::new();
            let observer = Box::new(Observer {
                log: Arc::new(Mutex::new(Vec::new())),
                handle: Arc::new(Mutex::new(None)),
            });
            let mut guard = TimeoutGuard::new(observer, event_loop.clone(), ms(1000), TimeoutMode::UntilNext);
            let subscription = guard.subscription();
            let upstream = Arc::new(FakeUpstream::default());

            let canceller = std::thread::spawn(move || subscription.cancel());
            guard.on_subscribe(upstream.clone());
            canceller.join().unwrap();

            assert!(upstream.cancelled.load(Ordering::SeqCst));
            assert_eq!(guard.state(), GuardState::Terminal);
        }
    }

    #[test]
    fn test_concurrent_cancel_and_fire_single_terminal() {
        for _ in 0..100 {
            let h = harness(TimeoutMode::UntilEos);
            let subscription = h.consumer_subscription();
            let event_loop = Arc::clone(&h.event_loop);

            let firer = std::thread::spawn(move || event_loop.advance(ms(1000)));
            subscription.cancel();
            firer.join().unwrap();
            h.event_loop.run_pending();

            let terminals = h
                .seen()
                .iter()
                .filter(|s| matches!(s, Seen::Timeout(_) | Seen::Cancelled))
                .count();
            assert_eq!(terminals, 1);
        }
    }
}
