//! Blocking queues
//!
//! [`ThreadSafeQueue`] is a FIFO guarded by one mutex and one condition
//! variable. Shutting it down discards everything pending and makes every
//! further operation fail, which is how blocked consumers are released.
//!
//! [`MessageQueue`] carries messages between threads. When built to pass
//! errors it can also carry a [`CommunicationError`] raised on a background
//! thread; that error is handed to exactly one dequeuer, in order with the
//! messages around it.

use crate::{CommunicationError, Message, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// FIFO queue shared between producer and consumer threads
pub struct ThreadSafeQueue<T> {
    state: Mutex<QueueState<T>>,
    condvar: Condvar,
    component: &'static str,
}

impl<T> ThreadSafeQueue<T> {
    /// Create a queue; `component` names it in shutdown errors
    pub fn new(component: &'static str) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
            component,
        }
    }

    /// Append an item and wake waiting consumers
    pub fn queue(&self, item: T) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(CommunicationError::shutdown(self.component));
        }
        state.items.push_back(item);
        self.condvar.notify_all();
        Ok(())
    }

    /// Take the oldest item.
    ///
    /// With `block` set, waits until an item arrives or the queue is shut
    /// down; otherwise returns `Ok(None)` when empty.
    pub fn dequeue(&self, block: bool) -> Result<Option<T>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(CommunicationError::shutdown(self.component));
            }
            if let Some(item) = state.items.pop_front() {
                if state.items.is_empty() {
                    self.condvar.notify_all();
                }
                return Ok(Some(item));
            }
            if !block {
                return Ok(None);
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Block until every queued item has been taken
    pub fn wait_until_empty(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(CommunicationError::shutdown(self.component));
            }
            if state.items.is_empty() {
                return Ok(());
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Discard pending items and release every waiter. Idempotent.
    ///
    /// Returns the number of items discarded.
    pub fn shutdown(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            if state.shutdown {
                return 0;
            }
            state.shutdown = true;
            std::mem::take(&mut state.items)
        };
        self.condvar.notify_all();
        // Items are dropped outside the lock; they may own resources.
        discarded.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

enum QueueItem {
    Message(Message),
    Error(CommunicationError),
}

/// Queue of messages, optionally interleaved with carried errors
pub struct MessageQueue {
    inner: ThreadSafeQueue<QueueItem>,
    pass_errors: bool,
}

impl MessageQueue {
    /// Create a queue; `pass_errors` allows [`enqueue_error`](Self::enqueue_error)
    pub fn new(pass_errors: bool) -> Self {
        Self {
            inner: ThreadSafeQueue::new("MessageQueue"),
            pass_errors,
        }
    }

    pub fn enqueue(&self, message: Message) -> Result<()> {
        self.inner.queue(QueueItem::Message(message))
    }

    /// Queue an error for the next dequeuer.
    ///
    /// # Panics
    ///
    /// If the queue was not created to pass errors.
    pub fn enqueue_error(&self, error: CommunicationError) -> Result<()> {
        assert!(
            self.pass_errors,
            "MessageQueue was not created to pass errors"
        );
        self.inner.queue(QueueItem::Error(error))
    }

    /// Take the next message.
    ///
    /// A carried error is returned as [`CommunicationError::Queued`]. Fails
    /// with [`CommunicationError::Shutdown`] once the queue is shut down.
    pub fn dequeue(&self, block: bool) -> Result<Option<Message>> {
        match self.inner.dequeue(block)? {
            None => Ok(None),
            Some(QueueItem::Message(message)) => Ok(Some(message)),
            Some(QueueItem::Error(error)) => Err(CommunicationError::queued(error)),
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn message(seq: i64) -> Message {
        let mut msg = Message::new(0, seq.to_be_bytes().to_vec());
        msg.set_sender_information("test", "queue-test", seq);
        msg
    }

    #[test]
    fn test_non_blocking_dequeue_on_empty() {
        let queue = MessageQueue::new(false);
        assert!(queue.dequeue(false).unwrap().is_none());
    }

    #[test]
    fn test_errors_interleave_with_messages() {
        let queue = MessageQueue::new(true);
        queue
            .enqueue_error(CommunicationError::protocol("ex1"))
            .unwrap();
        queue.enqueue(message(1)).unwrap();
        queue
            .enqueue_error(CommunicationError::protocol("ex2"))
            .unwrap();
        queue.enqueue(message(2)).unwrap();

        match queue.dequeue(false) {
            Err(CommunicationError::Queued { source }) => {
                assert!(source.to_string().contains("ex1"))
            }
            other => panic!("Expected queued ex1, got {:?}", other),
        }
        assert_eq!(queue.dequeue(false).unwrap().unwrap().sequence_number(), 1);
        match queue.dequeue(false) {
            Err(CommunicationError::Queued { source }) => {
                assert!(source.to_string().contains("ex2"))
            }
            other => panic!("Expected queued ex2, got {:?}", other),
        }
        assert_eq!(queue.dequeue(false).unwrap().unwrap().sequence_number(), 2);
        assert!(queue.dequeue(false).unwrap().is_none());
    }

    #[test]
    #[should_panic(expected = "not created to pass errors")]
    fn test_enqueue_error_without_pass_mode_panics() {
        let queue = MessageQueue::new(false);
        let _ = queue.enqueue_error(CommunicationError::protocol("nope"));
    }

    #[test]
    fn test_shutdown_discards_and_fails() {
        let queue = MessageQueue::new(false);
        queue.enqueue(message(0)).unwrap();
        queue.shutdown();
        queue.shutdown();

        assert!(queue.dequeue(false).unwrap_err().is_shutdown());
        assert!(queue.enqueue(message(1)).unwrap_err().is_shutdown());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_shutdown_releases_blocked_dequeuer() {
        let queue = Arc::new(MessageQueue::new(false));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.dequeue(true))
        };

        thread::sleep(Duration::from_millis(50));
        queue.shutdown();

        let result = waiter.join().unwrap();
        assert!(result.unwrap_err().is_shutdown());
    }

    #[test]
    fn test_blocking_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MessageQueue::new(false));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.dequeue(true))
        };

        thread::sleep(Duration::from_millis(20));
        queue.enqueue(message(7)).unwrap();

        let received = waiter.join().unwrap().unwrap().unwrap();
        assert_eq!(received.sequence_number(), 7);
    }

    #[test]
    fn test_concurrent_dequeuers_get_distinct_items() {
        let queue = Arc::new(ThreadSafeQueue::new("test"));
        for i in 0..1000u32 {
            queue.queue(i).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(item) = queue.dequeue(false).unwrap() {
                        taken.push(item);
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_until_empty() {
        let queue = Arc::new(ThreadSafeQueue::new("test"));
        queue.queue(1).unwrap();
        queue.queue(2).unwrap();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                while queue.dequeue(false).unwrap().is_some() {}
            })
        };

        queue.wait_until_empty().unwrap();
        assert!(queue.is_empty());
        consumer.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_fifo_order(items in proptest::collection::vec(any::<u64>(), 0..64)) {
            let queue = ThreadSafeQueue::new("prop");
            for item in &items {
                queue.queue(*item).unwrap();
            }
            let mut drained = Vec::new();
            while let Some(item) = queue.dequeue(false).unwrap() {
                drained.push(item);
            }
            prop_assert_eq!(drained, items);
        }
    }
}
