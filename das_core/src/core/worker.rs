//! # Serialized Task Queue
//!
//! A single mailbox drained by one worker: tasks run strictly one after the
//! other in submission order. Delayed work is parked on a timer and pushed
//! onto the same mailbox when it expires, so it still runs on the worker.
//!
//! Shutdown cancels a shared [`CancellationToken`]: pending timers are
//! dropped, the worker stops draining and any blocking wait inside a task
//! observes the same token.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::EngineError;

/// A task that can name itself in logs.
pub trait NamedTask: Send + 'static {
    fn name(&self) -> &'static str;
}

/// Sending side of the worker mailbox.
pub struct TaskQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    token: CancellationToken,
}

// Manual impl: `T` itself need not be `Clone`.
impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T: NamedTask> TaskQueue<T> {
    /// Creates the queue and hands back the receiving half for the worker.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            token: CancellationToken::new(),
        };
        (queue, rx)
    }

    /// Enqueues `task` for in-order execution on the worker.
    pub fn submit(&self, task: T) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        self.tx.send(task).map_err(|_| EngineError::Shutdown)
    }

    /// Enqueues `task` on the worker once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, task: T, delay: Duration) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        let deadline = Instant::now() + delay;
        let tx = self.tx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(task = task.name(), "delayed call dropped on shutdown");
                }
                _ = sleep_until(deadline) => {
                    let name = task.name();
                    info!(task = name, "delayed call");
                    if tx.send(task).is_err() {
                        debug!(task = name, "delayed call dropped, worker is gone");
                    }
                }
            }
        });
        Ok(())
    }

    /// Stops accepting work and interrupts the worker and pending timers.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
