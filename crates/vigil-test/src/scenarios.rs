//! Reference scenarios - Two-element streams under each timeout mode
//!
//! Every scenario runs on virtual time ([`Scenario::run_virtual`]) and on a
//! tokio event loop ([`Scenario::run_on`]); the outcome must be the same.

use std::time::Duration;

use vigil_core::{StreamMessage, StreamResult, TimeoutMode};
use vigil_stream::DefaultStream;
use vigil_time::{EventLoop, ManualEventLoop};
use vigil_timeout::{StreamTimeoutExt, TimeoutStream};

use crate::{
    check_single_terminal, tokio_clock, virtual_clock, Recording, RequestPlan,
    ScriptedSubscriber, Step, Terminal,
};

/// Elements every scenario publishes
pub const ELEMENTS: [&str; 2] = ["a", "b"];

/// Tolerated lateness of terminal signals on a real event loop
pub const TIMING_SLACK: Duration = Duration::from_millis(50);

/// A consumer plan against a two-element stream, with its expected outcome
#[derive(Clone, Debug)]
pub struct Scenario {
    pub name: &'static str,
    pub deadline: Duration,
    pub mode: TimeoutMode,
    pub plan: RequestPlan,
    pub expect_timeout: bool,
    /// When the terminal signal arrives
    pub expect_at: Duration,
    /// Elements delivered before it
    pub expect_items: usize,
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// The reference catalog
pub fn catalog() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "until_next_second_request_late",
            deadline: ms(1000),
            mode: TimeoutMode::UntilNext,
            plan: RequestPlan::paced(Step::now(1), Step::after(ms(2000), 1)),
            expect_timeout: true,
            expect_at: ms(1000),
            expect_items: 1,
        },
        Scenario {
            name: "until_next_all_requested",
            deadline: ms(1000),
            mode: TimeoutMode::UntilNext,
            plan: RequestPlan::upfront(2),
            expect_timeout: false,
            expect_at: Duration::ZERO,
            expect_items: 2,
        },
        Scenario {
            name: "until_first_first_request_late",
            deadline: ms(1000),
            mode: TimeoutMode::UntilFirst,
            plan: RequestPlan::paced(Step::after(ms(2000), 1), Step::now(1)),
            expect_timeout: true,
            expect_at: ms(1000),
            expect_items: 0,
        },
        Scenario {
            name: "until_first_first_request_immediate",
            deadline: ms(1000),
            mode: TimeoutMode::UntilFirst,
            plan: RequestPlan::paced(Step::now(1), Step::now(1)),
            expect_timeout: false,
            expect_at: Duration::ZERO,
            expect_items: 2,
        },
        Scenario {
            name: "until_eos_total_exceeds_deadline",
            deadline: ms(2000),
            mode: TimeoutMode::UntilEos,
            plan: RequestPlan::paced(Step::after(ms(1000), 1), Step::after(ms(2000), 1)),
            expect_timeout: true,
            expect_at: ms(2000),
            expect_items: 1,
        },
        Scenario {
            name: "until_eos_all_requested",
            deadline: ms(2000),
            mode: TimeoutMode::UntilEos,
            plan: RequestPlan::upfront(2),
            expect_timeout: false,
            expect_at: Duration::ZERO,
            expect_items: 2,
        },
    ]
}

impl Scenario {
    /// Closed two-element stream wrapped with this scenario's policy
    pub fn stream(&self) -> StreamResult<TimeoutStream<&'static str, DefaultStream<&'static str>>> {
        DefaultStream::of(ELEMENTS).timeout(self.deadline, self.mode)
    }

    /// Run to completion on virtual time
    pub fn run_virtual(&self) -> StreamResult<Recording<&'static str>> {
        let event_loop = ManualEventLoop::new();
        let recording = Recording::new(virtual_clock(&event_loop));
        let consumer = ScriptedSubscriber::new(self.plan, event_loop.clone(), recording.clone());

        self.stream()?
            .subscribe(Box::new(consumer), event_loop.clone(), &[]);
        event_loop.run_pending();

        // Until quiescent: no timers left that could produce a signal
        while let Some(next) = event_loop.next_deadline() {
            event_loop.advance_to(next);
        }

        Ok(recording)
    }

    /// Run to completion on a tokio event loop
    pub async fn run_on(&self, event_loop: &EventLoop) -> StreamResult<Recording<&'static str>> {
        let recording = Recording::new(tokio_clock());
        let executor = event_loop.as_executor();
        let consumer = ScriptedSubscriber::new(self.plan, executor.clone(), recording.clone());

        tracing::info!(scenario = self.name, deadline = ?self.deadline, mode = %self.mode, "running scenario");
        self.stream()?.subscribe(Box::new(consumer), executor, &[]);

        // Outcome is read from the recording; the completion only paces us
        let _ = tokio::time::timeout(self.deadline * 5, recording.completion().wait()).await;
        Ok(recording)
    }

    /// Compare a run with the expected outcome, allowing `slack` of lateness
    pub fn verify(&self, recording: &Recording<&'static str>, slack: Duration) -> Result<(), String> {
        check_single_terminal(recording).map_err(|reason| format!("{}: {reason}", self.name))?;

        let terminal = recording.terminal();
        let outcome_matches = match (&terminal, self.expect_timeout) {
            (Some(Terminal::TimedOut(error)), true) => {
                error.deadline == self.deadline && error.mode == self.mode
            }
            (Some(Terminal::Complete), false) => true,
            _ => false,
        };
        if !outcome_matches {
            return Err(format!(
                "{}: observed {terminal:?}, expected timeout={}",
                self.name, self.expect_timeout
            ));
        }

        let items = recording.items();
        if items[..] != ELEMENTS[..self.expect_items] {
            return Err(format!("{}: delivered {items:?}", self.name));
        }

        match recording.terminal_at() {
            Some(at) if at >= self.expect_at && at <= self.expect_at + slack => Ok(()),
            at => Err(format!(
                "{}: terminal at {at:?}, expected {:?}",
                self.name, self.expect_at
            )),
        }
    }
}
