//! Guard transition table
//!
//! The whole timing policy lives in [`transition`]: given the mode, the current
//! state and an event, it returns the next state, what to do with the timer and
//! what to do with the signal. The guard only executes the answer.

use vigil_core::TimeoutMode;

/// Guard state for one subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GuardState {
    /// Waiting for `on_subscribe`
    Idle,
    /// A deadline timer is pending
    Armed,
    /// No timer pending and none will be armed (UNTIL_FIRST after the first element)
    Disarmed,
    /// A terminal signal was claimed; everything else is ignored
    Terminal,
}

/// Signals the guard reacts to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GuardEvent {
    Subscribe,
    Next,
    Complete,
    Error,
    TimerFired,
    /// Consumer or external caller cancelled the subscription
    Cancel,
}

impl GuardEvent {
    /// Can this event end the subscription?
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GuardEvent::Complete | GuardEvent::Error | GuardEvent::TimerFired | GuardEvent::Cancel
        )
    }
}

/// What to do with the deadline timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerAction {
    Keep,
    Arm,
    /// Cancel the pending timer and arm a fresh one
    Rearm,
    /// Cancel the pending timer and release it
    Cancel,
}

/// What to do with the signal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Deliver unchanged to the consumer
    Forward,
    /// Drop silently
    Ignore,
    /// Cancel upstream and fail the consumer with a timeout
    TimedOut,
    /// Cancel upstream and fail the consumer with a cancellation
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Transition {
    pub next: GuardState,
    pub timer: TimerAction,
    pub outcome: Outcome,
}

impl Transition {
    #[inline]
    const fn new(next: GuardState, timer: TimerAction, outcome: Outcome) -> Self {
        Transition {
            next,
            timer,
            outcome,
        }
    }

    #[inline]
    const fn ignore(state: GuardState) -> Self {
        Transition::new(state, TimerAction::Keep, Outcome::Ignore)
    }
}

/// Evaluate one event against the policy table
pub fn transition(mode: TimeoutMode, state: GuardState, event: GuardEvent) -> Transition {
    use GuardEvent as E;
    use GuardState as S;
    use Outcome as O;
    use TimerAction as A;

    match (state, event) {
        (S::Terminal, _) => Transition::ignore(S::Terminal),

        // Every policy starts the clock at subscription
        (S::Idle, E::Subscribe) => Transition::new(S::Armed, A::Arm, O::Forward),
        (S::Idle, E::Complete | E::Error) => Transition::new(S::Terminal, A::Keep, O::Forward),
        (S::Idle, E::Cancel) => Transition::new(S::Terminal, A::Keep, O::Cancelled),
        (S::Idle, E::Next | E::TimerFired) => Transition::ignore(S::Idle),

        // A second on_subscribe is a protocol violation
        (S::Armed | S::Disarmed, E::Subscribe) => Transition::ignore(state),

        (S::Armed, E::Next) => match mode {
            TimeoutMode::UntilFirst => Transition::new(S::Disarmed, A::Cancel, O::Forward),
            TimeoutMode::UntilNext => Transition::new(S::Armed, A::Rearm, O::Forward),
            TimeoutMode::UntilEos => Transition::new(S::Armed, A::Keep, O::Forward),
        },
        (S::Disarmed, E::Next) => Transition::new(S::Disarmed, A::Keep, O::Forward),

        (S::Armed, E::Complete | E::Error) => Transition::new(S::Terminal, A::Cancel, O::Forward),
        (S::Disarmed, E::Complete | E::Error) => {
            Transition::new(S::Terminal, A::Keep, O::Forward)
        }

        (S::Armed, E::TimerFired) => Transition::new(S::Terminal, A::Cancel, O::TimedOut),
        // Stale fire after disarm
        (S::Disarmed, E::TimerFired) => Transition::ignore(S::Disarmed),

        (S::Armed, E::Cancel) => Transition::new(S::Terminal, A::Cancel, O::Cancelled),
        (S::Disarmed, E::Cancel) => Transition::new(S::Terminal, A::Keep, O::Cancelled),
    }
}
