//! Timeline simulation - Scripted producers on virtual time
//!
//! A [`Timeline`] says when a producer writes each element and when it closes.
//! Driving it against a guarded stream on a [`ManualEventLoop`] gives fully
//! deterministic runs, and [`Timeline::expected`] predicts their outcome from
//! the timeout policy alone.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use vigil_core::{ExecutorRef, StreamError, TimeoutMode};
use vigil_stream::DefaultStream;

/// Producer schedule: gaps between consecutive events, starting at subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeline {
    /// Gap before each element
    pub element_gaps: Vec<Duration>,
    /// Gap between the last element (or subscription) and close
    pub close_gap: Duration,
    /// Close with an upstream error instead of completing
    pub fails: bool,
}

/// How a run is predicted to end
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Completes,
    Fails,
    TimesOut,
}

/// Predicted outcome of a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expectation {
    pub verdict: Verdict,
    /// When the terminal signal arrives
    pub at: Duration,
    /// Elements delivered before it
    pub items: usize,
}

/// Message carried by failing timelines
pub const PRODUCER_FAILURE: &str = "producer failed";

impl Timeline {
    pub fn new(element_gaps: Vec<Duration>, close_gap: Duration) -> Self {
        Timeline {
            element_gaps,
            close_gap,
            fails: false,
        }
    }

    /// Same schedule, ending in an upstream error
    pub fn failing(mut self) -> Self {
        self.fails = true;
        self
    }

    /// Random schedule with gaps in `[0, max_gap]` at millisecond resolution
    pub fn random(rng: &mut StdRng, elements: usize, max_gap: Duration) -> Self {
        let max_ms = max_gap.as_millis() as u64;
        let mut gap = || Duration::from_millis(rng.gen_range(0..=max_ms));
        let element_gaps = (0..elements).map(|_| gap()).collect();
        let close_gap = gap();
        Timeline::new(element_gaps, close_gap)
    }

    /// Absolute element times, measured from subscription
    pub fn arrivals(&self) -> Vec<Duration> {
        self.element_gaps
            .iter()
            .scan(Duration::ZERO, |at, gap| {
                *at += *gap;
                Some(*at)
            })
            .collect()
    }

    pub fn close_at(&self) -> Duration {
        self.element_gaps.iter().sum::<Duration>() + self.close_gap
    }

    /// Instant the guard should fire, if it fires at all
    ///
    /// A progress event landing exactly on the deadline loses the race: the
    /// deadline counts as elapsed.
    pub fn timeout_at(&self, deadline: Duration, mode: TimeoutMode) -> Option<Duration> {
        let arrivals = self.arrivals();
        let close_at = self.close_at();

        match mode {
            TimeoutMode::UntilFirst => {
                let first = arrivals.first().copied().unwrap_or(close_at);
                (first >= deadline).then_some(deadline)
            }
            TimeoutMode::UntilNext => {
                let mut previous = Duration::ZERO;
                for at in arrivals.into_iter().chain(std::iter::once(close_at)) {
                    if at - previous >= deadline {
                        return Some(previous + deadline);
                    }
                    previous = at;
                }
                None
            }
            TimeoutMode::UntilEos => (close_at >= deadline).then_some(deadline),
        }
    }

    /// Outcome for an unbounded consumer
    pub fn expected(&self, deadline: Duration, mode: TimeoutMode) -> Expectation {
        match self.timeout_at(deadline, mode) {
            Some(at) => Expectation {
                verdict: Verdict::TimesOut,
                at,
                items: self.arrivals().iter().filter(|t| **t < at).count(),
            },
            None => Expectation {
                verdict: if self.fails {
                    Verdict::Fails
                } else {
                    Verdict::Completes
                },
                at: self.close_at(),
                items: self.element_gaps.len(),
            },
        }
    }

    /// Play the schedule into `stream`, starting now
    ///
    /// Each event schedules the next one only after its own delivery has been
    /// queued, so the producer always reacts after the consumer side.
    /// Elements are numbered from zero. Stops early once the stream refuses
    /// writes.
    pub fn drive(&self, executor: ExecutorRef, stream: DefaultStream<u32>) {
        let mut gaps = self.element_gaps.clone();
        gaps.push(self.close_gap);
        let gaps: Arc<[Duration]> = gaps.into();
        play(executor, stream, gaps, 0, self.fails);
    }
}

fn play(executor: ExecutorRef, stream: DefaultStream<u32>, gaps: Arc<[Duration]>, index: usize, fails: bool) {
    let Some(&gap) = gaps.get(index) else {
        return;
    };
    let is_close = index + 1 == gaps.len();
    let scheduler = Arc::clone(&executor);

    scheduler.schedule(
        gap,
        Box::new(move || {
            if is_close {
                if fails {
                    let cause = std::io::Error::new(std::io::ErrorKind::Other, PRODUCER_FAILURE);
                    stream.close_with(StreamError::upstream(cause));
                } else {
                    stream.close();
                }
                return;
            }

            if !stream.write(index as u32) {
                tracing::trace!(index, "producer stopped, stream closed");
                return;
            }

            let next = Arc::clone(&executor);
            executor.execute(Box::new(move || play(next, stream, gaps, index + 1, fails)));
        }),
    );
}
