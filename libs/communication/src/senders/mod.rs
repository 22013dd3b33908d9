//! Message Senders
//!
//! Every sender stamps outgoing messages with its process id, its unique
//! instance id and the next sequence number, then hands them to a
//! transport-specific [`MessageWriter`]. [`SenderCore`] holds the machinery
//! shared by all of them: stamping, the outbound queue behind
//! [`QueuedSender::queue`] and [`QueuedSender::flush`], and shutdown.

pub mod fan_out;
pub mod handler_chain;
pub mod queued;
pub mod stream;

pub use fan_out::{FanOutServerSender, FanOutStreamSender, PeerFailureListener, StreamId};
pub use handler_chain::{HandlerChainSender, MessageHandler};
pub use queued::QueuedSenderDecorator;
pub use stream::{ClientSender, StreamSender};

use crate::{generate_instance_id, Message, MessageQueue, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Something that delivers messages
pub trait Sender: Send + Sync {
    /// Deliver one message
    fn send(&self, message: Message) -> Result<()>;

    /// Release the transport. Idempotent.
    fn shutdown(&self);
}

/// A sender that can batch messages before writing them
pub trait QueuedSender: Sender {
    /// Stamp and hold a message until the next flush
    fn queue(&self, message: Message) -> Result<()>;

    /// Write every held message, in order
    fn flush(&self) -> Result<()>;
}

/// Transport half of a sender
pub trait MessageWriter: Send + Sync {
    /// Write one stamped message
    fn write_message(&self, message: &Message) -> Result<()>;

    /// Whether the peer expects a close-communication message at shutdown
    fn announces_shutdown(&self) -> bool {
        false
    }

    /// Release the transport once the sender has shut down
    fn close(&self) {}
}

/// Stamping, queueing and shutdown shared by every sender
pub struct SenderCore<W: MessageWriter> {
    process_id: String,
    instance_id: String,
    /// Held only around stamping and enqueueing
    next_sequence: Mutex<i64>,
    /// Serialises flushes so a send cannot be split by another flush
    flush_lock: Mutex<()>,
    queue: MessageQueue,
    writer: W,
    shutdown: AtomicBool,
}

impl<W: MessageWriter> SenderCore<W> {
    /// Create a sender core.
    ///
    /// `discriminator` should describe the transport endpoint; it feeds the
    /// unique instance id.
    pub fn new(process_id: impl Into<String>, discriminator: &str, writer: W) -> Self {
        let process_id = process_id.into();
        let instance_id = generate_instance_id(&format!("{}:{}", process_id, discriminator));
        debug!(process_id = %process_id, instance_id = %instance_id, "Sender created");

        Self {
            process_id,
            instance_id,
            next_sequence: Mutex::new(0),
            flush_lock: Mutex::new(()),
            queue: MessageQueue::new(false),
            writer,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn queue(&self, mut message: Message) -> Result<()> {
        let mut next_sequence = self.next_sequence.lock();
        message.set_sender_information(&self.process_id, &self.instance_id, *next_sequence);
        self.queue.enqueue(message)?;
        *next_sequence += 1;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        self.flush_queued()
    }

    /// Queue then flush, with no other flush in between
    pub fn send(&self, message: Message) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        self.queue(message)?;
        self.flush_queued()
    }

    /// Shut the sender down. Idempotent.
    ///
    /// Writers that announce shutdown get a final close-communication
    /// message, which also flushes anything still queued. Otherwise queued
    /// messages are discarded.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.writer.announces_shutdown() {
            if let Err(e) = self.send(Message::close_communication()) {
                debug!(instance_id = %self.instance_id, "Close announcement failed: {}", e);
            }
        }

        self.queue.shutdown();
        self.writer.close();
        debug!(instance_id = %self.instance_id, "Sender shut down");
    }

    fn flush_queued(&self) -> Result<()> {
        while let Some(message) = self.queue.dequeue(false)? {
            self.writer.write_message(&message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommunicationError;

    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<Message>>,
        announce: bool,
        closes: Mutex<usize>,
        fail: AtomicBool,
    }

    impl MessageWriter for RecordingWriter {
        fn write_message(&self, message: &Message) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CommunicationError::connection("write failed", None));
            }
            self.written.lock().push(message.clone());
            Ok(())
        }

        fn announces_shutdown(&self) -> bool {
            self.announce
        }

        fn close(&self) {
            *self.closes.lock() += 1;
        }
    }

    fn sequence_numbers(core: &SenderCore<RecordingWriter>) -> Vec<i64> {
        core.writer()
            .written
            .lock()
            .iter()
            .map(|m| m.sequence_number())
            .collect()
    }

    #[test]
    fn test_send_stamps_increasing_sequence() {
        let core = SenderCore::new("worker-1", "test", RecordingWriter::default());
        for i in 0..5u8 {
            core.send(Message::new(1, vec![i])).unwrap();
        }

        assert_eq!(sequence_numbers(&core), vec![0, 1, 2, 3, 4]);
        let written = core.writer().written.lock();
        assert!(written
            .iter()
            .all(|m| m.sender_instance_id() == core.instance_id()
                && m.sender_process_id() == "worker-1"));
    }

    #[test]
    fn test_queue_holds_until_flush() {
        let core = SenderCore::new("p", "test", RecordingWriter::default());
        core.queue(Message::new(1, vec![1])).unwrap();
        core.queue(Message::new(1, vec![2])).unwrap();
        assert!(core.writer().written.lock().is_empty());

        core.flush().unwrap();
        assert_eq!(sequence_numbers(&core), vec![0, 1]);
    }

    #[test]
    fn test_instances_have_distinct_ids() {
        let a = SenderCore::new("p", "same", RecordingWriter::default());
        let b = SenderCore::new("p", "same", RecordingWriter::default());
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_failed_write_reports_error_and_sender_recovers() {
        let core = SenderCore::new("p", "test", RecordingWriter::default());
        core.queue(Message::new(1, vec![1])).unwrap();
        core.writer().fail.store(true, Ordering::SeqCst);
        assert!(core.flush().is_err());

        core.writer().fail.store(false, Ordering::SeqCst);
        core.send(Message::new(1, vec![2])).unwrap();
        assert_eq!(sequence_numbers(&core), vec![1]);
    }

    #[test]
    fn test_shutdown_discards_queue_and_is_idempotent() {
        let core = SenderCore::new("p", "test", RecordingWriter::default());
        core.queue(Message::new(1, vec![1])).unwrap();

        core.shutdown();
        core.shutdown();

        assert!(core.writer().written.lock().is_empty());
        assert_eq!(*core.writer().closes.lock(), 1);
        assert!(core.send(Message::new(1, vec![2])).unwrap_err().is_shutdown());
    }

    #[test]
    fn test_announcing_writer_gets_close_message() {
        let writer = RecordingWriter {
            announce: true,
            ..RecordingWriter::default()
        };
        let core = SenderCore::new("p", "test", writer);
        core.queue(Message::new(1, vec![1])).unwrap();
        core.shutdown();

        let written = core.writer().written.lock();
        assert_eq!(written.len(), 2);
        assert!(written[1].is_close_communication());
        assert_eq!(written[1].sequence_number(), 1);
    }
}
