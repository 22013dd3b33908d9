//! Handler chains
//!
//! Offers each message to an ordered list of handlers until one claims it.
//! Used in-process to route messages without a socket in between.

use super::Sender;
use crate::{Message, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Consumes messages in a [`HandlerChainSender`]
pub trait MessageHandler: Send + Sync {
    /// Returns true if the message was handled and the chain should stop
    fn process(&self, message: &Message) -> Result<bool>;

    fn shutdown(&self);
}

/// Passes every message to a sender; never claims it
struct SenderHandler(Arc<dyn Sender>);

impl MessageHandler for SenderHandler {
    fn process(&self, message: &Message) -> Result<bool> {
        self.0.send(message.clone())?;
        Ok(false)
    }

    fn shutdown(&self) {
        self.0.shutdown();
    }
}

/// Sender that dispatches to a chain of handlers
#[derive(Default)]
pub struct HandlerChainSender {
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerChainSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(handler);
    }

    /// Append a sender as a handler that forwards and lets the chain continue
    pub fn add_sender(&self, sender: Arc<dyn Sender>) {
        self.add(Arc::new(SenderHandler(sender)));
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Sender for HandlerChainSender {
    /// Offer the message to each handler in turn.
    ///
    /// Stops at the first handler that claims the message or fails; a
    /// failure is returned to the caller.
    fn send(&self, message: Message) -> Result<()> {
        let handlers = self.handlers.read().clone();

        for (index, handler) in handlers.iter().enumerate() {
            match handler.process(&message) {
                Ok(true) => {
                    debug!(handler = index, "Message handled");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(handler = index, "Handler failed: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommunicationError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TagHandler {
        claims: Option<u16>,
        fail: bool,
        seen: Mutex<Vec<u16>>,
        shutdowns: AtomicUsize,
    }

    impl TagHandler {
        fn claiming(tag: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                claims: tag,
                fail: false,
                seen: Mutex::new(Vec::new()),
                shutdowns: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                claims: None,
                fail: true,
                seen: Mutex::new(Vec::new()),
                shutdowns: AtomicUsize::new(0),
            })
        }
    }

    impl MessageHandler for TagHandler {
        fn process(&self, message: &Message) -> Result<bool> {
            let tag = message.tag().unwrap_or_default();
            self.seen.lock().push(tag);
            if self.fail {
                return Err(CommunicationError::protocol("handler rejected message"));
            }
            Ok(self.claims == Some(tag))
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingSender {
        sent: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl Sender for CountingSender {
        fn send(&self, _message: Message) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_chain_stops_at_claiming_handler() {
        let chain = HandlerChainSender::new();
        let first = TagHandler::claiming(Some(1));
        let second = TagHandler::claiming(Some(2));
        chain.add(first.clone());
        chain.add(second.clone());

        chain.send(Message::new(1, vec![])).unwrap();
        chain.send(Message::new(2, vec![])).unwrap();
        chain.send(Message::new(3, vec![])).unwrap();

        assert_eq!(*first.seen.lock(), vec![1, 2, 3]);
        assert_eq!(*second.seen.lock(), vec![2, 3]);
    }

    #[test]
    fn test_failure_ends_chain_and_is_returned() {
        let chain = HandlerChainSender::new();
        let failing = TagHandler::failing();
        let after = TagHandler::claiming(None);
        chain.add(failing.clone());
        chain.add(after.clone());

        let err = chain.send(Message::new(1, vec![])).unwrap_err();
        assert_eq!(err.category(), "protocol");
        assert!(after.seen.lock().is_empty());
    }

    #[test]
    fn test_sender_in_chain_forwards_and_continues() {
        let chain = HandlerChainSender::new();
        let sender = Arc::new(CountingSender::default());
        let tail = TagHandler::claiming(None);
        chain.add_sender(sender.clone());
        chain.add(tail.clone());

        chain.send(Message::new(7, vec![])).unwrap();

        assert_eq!(sender.sent.load(Ordering::SeqCst), 1);
        assert_eq!(*tail.seen.lock(), vec![7]);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_shutdown_reaches_every_handler() {
        let chain = HandlerChainSender::new();
        let handler = TagHandler::claiming(Some(1));
        let sender = Arc::new(CountingSender::default());
        chain.add(handler.clone());
        chain.add_sender(sender.clone());

        chain.shutdown();

        assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(sender.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_chain_accepts_messages() {
        let chain = HandlerChainSender::new();
        assert!(chain.is_empty());
        chain.send(Message::new(1, vec![])).unwrap();
    }
}
