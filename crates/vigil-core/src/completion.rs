//! Completion event - resolved exactly once per stream

use tokio::sync::watch;

use crate::{StreamError, StreamResult};

type Slot = Option<StreamResult<()>>;

/// Producer side of a stream's completion event
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<Slot>,
}

/// Observer side of a stream's completion event
#[derive(Clone, Debug)]
pub struct Completion {
    rx: watch::Receiver<Slot>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        CompletionSignal { tx }
    }

    /// Resolve the event. Only the first call has an effect.
    pub fn complete(&self, result: StreamResult<()>) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        })
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// A new observer of this event
    pub fn subscribe(&self) -> Completion {
        Completion {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    /// Current outcome, if resolved
    pub fn get(&self) -> Option<StreamResult<()>> {
        self.rx.borrow().clone()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the outcome.
    /// A producer dropped without resolving counts as an abort.
    pub async fn wait(mut self) -> StreamResult<()> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(StreamError::Aborted))
    }
}
