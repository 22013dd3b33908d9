//! Message Receivers
//!
//! Every receiver hands out messages through [`Receiver::wait_for_message`]
//! and checks that each sender's sequence numbers arrive without gaps.
//! [`ReceiverCore`] holds the queue and the sequence tracking shared by the
//! queue-fed receivers.

pub mod server;
pub mod stream;

pub use server::ServerReceiver;
pub use stream::{ClientReceiver, StreamReceiver};

use crate::{CommunicationError, Message, MessageQueue, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Something that delivers incoming messages
pub trait Receiver: Send + Sync {
    /// Block until a message arrives.
    ///
    /// Returns `Ok(None)` once the receiver has been shut down.
    fn wait_for_message(&self) -> Result<Option<Message>>;

    /// Stop receiving and wake blocked callers. Idempotent.
    fn shutdown(&self);
}

/// Per-sender sequence tracking.
///
/// A gap does not stop delivery: the message is passed on, the tracker
/// resynchronises to the observed number and the error is held for
/// [`take_error`](Self::take_error).
#[derive(Debug, Default)]
pub struct SequenceChecker {
    last_seen: HashMap<String, i64>,
    errors: VecDeque<CommunicationError>,
}

impl SequenceChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one delivered message. Unstamped messages are ignored.
    pub fn check(&mut self, message: &Message) {
        let Some(sender) = message.sender_information() else {
            return;
        };
        let received = sender.sequence_number;

        match self.last_seen.get_mut(&sender.instance_id) {
            None => {
                self.last_seen.insert(sender.instance_id.clone(), received);
            }
            Some(last) => {
                let expected = *last + 1;
                *last = received;
                if received != expected {
                    warn!(
                        sender = %sender.process_id,
                        expected,
                        received,
                        "Out of sequence message"
                    );
                    self.errors.push_back(CommunicationError::OutOfSequence {
                        sender: sender.process_id.clone(),
                        expected,
                        received,
                    });
                }
            }
        }
    }

    /// Oldest gap not yet reported
    pub fn take_error(&mut self) -> Option<CommunicationError> {
        self.errors.pop_front()
    }

    /// Number of distinct senders seen
    pub fn senders(&self) -> usize {
        self.last_seen.len()
    }
}

/// Queue and sequence checking shared by queue-fed receivers
pub struct ReceiverCore {
    queue: MessageQueue,
    checker: Option<Mutex<SequenceChecker>>,
}

impl ReceiverCore {
    pub fn new(check_sequence: bool) -> Self {
        Self {
            queue: MessageQueue::new(true),
            checker: check_sequence.then(|| Mutex::new(SequenceChecker::new())),
        }
    }

    /// Where producers put incoming messages and errors
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Take the next message, or a sequence gap found by an earlier call.
    ///
    /// The checker lock is held across the dequeue so messages are checked
    /// in the order they are handed out.
    pub fn wait_for_message(&self) -> Result<Option<Message>> {
        let Some(checker) = &self.checker else {
            return self.dequeue();
        };

        let mut checker = checker.lock();
        if let Some(error) = checker.take_error() {
            return Err(error);
        }

        let message = self.dequeue()?;
        if let Some(message) = &message {
            checker.check(message);
        }
        Ok(message)
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.queue.is_shutdown()
    }

    fn dequeue(&self) -> Result<Option<Message>> {
        match self.queue.dequeue(true) {
            Err(e) if e.is_shutdown() => Ok(None),
            other => other,
        }
    }
}
