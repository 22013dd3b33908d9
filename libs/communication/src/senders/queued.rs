//! Queueing decorator
//!
//! Gives any [`Sender`] a queue-then-flush interface. Messages are held
//! unstamped; the delegate stamps them as it sends them at flush time.

use super::{QueuedSender, Sender};
use crate::{Message, MessageQueue, Result};
use parking_lot::Mutex;
use tracing::debug;

/// Adds [`QueuedSender`] behaviour to a plain [`Sender`]
pub struct QueuedSenderDecorator<S: Sender> {
    delegate: S,
    queue: MessageQueue,
    flush_lock: Mutex<()>,
}

impl<S: Sender> QueuedSenderDecorator<S> {
    pub fn new(delegate: S) -> Self {
        Self {
            delegate,
            queue: MessageQueue::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn delegate(&self) -> &S {
        &self.delegate
    }

    /// Messages waiting for the next flush
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn flush_queued(&self) -> Result<()> {
        while let Some(message) = self.queue.dequeue(false)? {
            self.delegate.send(message)?;
        }
        Ok(())
    }
}

impl<S: Sender> Sender for QueuedSenderDecorator<S> {
    /// Flushes anything queued first so order is preserved
    fn send(&self, message: Message) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        self.queue.enqueue(message)?;
        self.flush_queued()
    }

    fn shutdown(&self) {
        if !self.queue.is_shutdown() {
            let discarded = self.queue.len();
            self.queue.shutdown();
            if discarded > 0 {
                debug!(discarded, "Queued messages discarded at shutdown");
            }
        }
        self.delegate.shutdown();
    }
}

impl<S: Sender> QueuedSender for QueuedSenderDecorator<S> {
    fn queue(&self, message: Message) -> Result<()> {
        self.queue.enqueue(message)
    }

    fn flush(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        self.flush_queued()
    }
}
