//! Serialises concurrent exchanges onto the strictly sequential wire.
//!
//! Submissions may come from any task; the queue is the only
//! cross-task hand-off point. One slot is active at a time, and tasks
//! activate in exact submission order.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::messages::{ClientMessage, ServerMessage};

/// A unit of work waiting for the wire.
#[derive(Debug)]
pub(crate) enum RequestTask {
    /// A user exchange: write `request`, route server messages into
    /// `responses` until the terminator, accept follow-up client
    /// messages from `replies` meanwhile.
    Exchange {
        request: ClientMessage,
        responses: mpsc::UnboundedSender<Result<ServerMessage>>,
        replies: mpsc::Receiver<ClientMessage>,
    },
    /// The graceful close: write `COM_QUIT`, signal `done`, stop.
    Exit { done: oneshot::Sender<()> },
}

impl RequestTask {
    /// Fails a task that will never reach the wire.
    fn fail(self, error: Error) {
        match self {
            RequestTask::Exchange { responses, .. } => {
                let _ = responses.send(Err(error));
            }
            // Dropping `done` tells close() to fall through to the
            // forced close.
            RequestTask::Exit { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    active: bool,
    pending: VecDeque<RequestTask>,
    disposed: Option<Error>,
}

/// FIFO of pending tasks with an internal active slot.
///
/// Safe under concurrent `submit` with at most one concurrent
/// `run`/`dispose` caller (the engine task).
#[derive(Debug)]
pub(crate) struct RequestQueue {
    inner: Mutex<Inner>,
    activations: mpsc::UnboundedSender<RequestTask>,
}

impl RequestQueue {
    /// Creates the queue and the activation stream the engine drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RequestTask>) {
        let (activations, activation_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Mutex::new(Inner::default()),
                activations,
            },
            activation_rx,
        )
    }

    /// Either activates `task` right away or parks it behind the
    /// in-flight exchange. Tasks submitted after disposal fail
    /// immediately with the dispose error.
    pub fn submit(&self, task: RequestTask) {
        let rejected = {
            let mut inner = self.inner.lock();
            if let Some(error) = &inner.disposed {
                Some((task, error.clone()))
            } else if inner.active {
                inner.pending.push_back(task);
                None
            } else {
                inner.active = true;
                self.activations.send(task).err().map(|send_error| {
                    (send_error.0, Error::ExchangeClosed)
                })
            }
        };

        if let Some((task, error)) = rejected {
            task.fail(error);
        }
    }

    /// Releases the active slot and activates the next pending task.
    /// Invoked by the engine on each exchange completion.
    pub fn run(&self) {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.disposed.is_some() {
                return;
            }
            match inner.pending.pop_front() {
                Some(task) => self.activations.send(task).err().map(|send_error| {
                    (send_error.0, Error::ExchangeClosed)
                }),
                None => {
                    inner.active = false;
                    None
                }
            }
        };

        if let Some((task, error)) = rejected {
            task.fail(error);
        }
    }

    /// Drains the queue: every pending task fails with `error`, and
    /// every later submit fails the same way.
    pub fn dispose(&self, error: Error) {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.disposed.is_some() {
                return;
            }
            inner.disposed = Some(error.clone());
            inner.active = false;
            std::mem::take(&mut inner.pending)
        };

        for task in pending {
            task.fail(error.clone());
        }
    }

    #[cfg(test)]
    fn is_active(&self) -> bool {
        self.inner.lock().active
    }
}
