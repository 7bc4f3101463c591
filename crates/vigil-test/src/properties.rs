//! Property checks - Timelines against the timeout policies
//!
//! Runs a [`Timeline`] through a guarded stream on virtual time and compares
//! what the consumer saw with what [`Timeline::expected`] predicts.

use std::sync::Arc;
use std::time::Duration;

use vigil_core::{StreamMessage, StreamResult, TimeoutMode};
use vigil_stream::DefaultStream;
use vigil_time::ManualEventLoop;
use vigil_timeout::StreamTimeoutExt;

use crate::{
    virtual_clock, Recording, RequestPlan, ScriptedSubscriber, Terminal, Timeline, Verdict,
    PRODUCER_FAILURE,
};

/// A finished timeline run
pub struct TimelineRun {
    pub event_loop: Arc<ManualEventLoop>,
    pub upstream: DefaultStream<u32>,
    pub recording: Recording<u32>,
}

/// Play `timeline` through a guard with the given policy and consumer plan
pub fn run_timeline(
    timeline: &Timeline,
    deadline: Duration,
    mode: TimeoutMode,
    plan: RequestPlan,
) -> StreamResult<TimelineRun> {
    let event_loop = ManualEventLoop::new();
    let recording = Recording::new(virtual_clock(&event_loop));

    let guarded = DefaultStream::<u32>::new().timeout(deadline, mode)?;
    let upstream = guarded.get_ref().clone();
    let consumer = ScriptedSubscriber::new(plan, event_loop.clone(), recording.clone());

    guarded.subscribe(Box::new(consumer), event_loop.clone(), &[]);
    event_loop.run_pending();
    timeline.drive(event_loop.clone(), upstream.clone());

    let horizon = timeline.close_at() + deadline * 2;
    event_loop.advance_to(horizon);

    Ok(TimelineRun {
        event_loop,
        upstream,
        recording,
    })
}

/// Run with an unbounded consumer and compare against the prediction
pub fn check_timeline(timeline: &Timeline, deadline: Duration, mode: TimeoutMode) -> Result<(), String> {
    let run = run_timeline(timeline, deadline, mode, RequestPlan::unbounded())
        .map_err(|cause| cause.to_string())?;
    let expected = timeline.expected(deadline, mode);
    let recording = &run.recording;

    check_single_terminal(recording)?;

    let terminal = recording
        .terminal()
        .ok_or_else(|| "no terminal signal".to_string())?;
    let verdict_matches = match (&expected.verdict, &terminal) {
        (Verdict::TimesOut, Terminal::TimedOut(error)) => {
            error.deadline == deadline && error.mode == mode
        }
        (Verdict::Completes, Terminal::Complete) => true,
        (Verdict::Fails, Terminal::Failed(message)) => message.contains(PRODUCER_FAILURE),
        _ => false,
    };
    if !verdict_matches {
        return Err(format!("expected {:?}, observed {terminal:?}", expected.verdict));
    }

    if recording.terminal_at() != Some(expected.at) {
        return Err(format!(
            "terminal at {:?}, expected at {:?}",
            recording.terminal_at(),
            expected.at
        ));
    }

    let items = recording.items();
    let in_order = items.iter().enumerate().all(|(i, item)| *item == i as u32);
    if items.len() != expected.items || !in_order {
        return Err(format!("delivered {items:?}, expected {} in order", expected.items));
    }

    if run.event_loop.pending_timers() != 0 {
        return Err(format!("{} timers left pending", run.event_loop.pending_timers()));
    }

    Ok(())
}

/// Exactly one terminal signal and nothing after it
pub fn check_single_terminal<T: Clone>(recording: &Recording<T>) -> Result<(), String> {
    match recording.terminal_count() {
        1 => {}
        n => return Err(format!("{n} terminal signals")),
    }
    match recording.after_terminal() {
        0 => Ok(()),
        n => Err(format!("{n} signals after terminal")),
    }
}
